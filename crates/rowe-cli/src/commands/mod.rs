pub mod run;
pub mod worker;

use rowe_core::config::RoweConfig;

/// `rowe server` — load config, apply flag overrides, serve until
/// interrupted.
pub async fn server(host: Option<String>, port: Option<u16>, db: Option<String>) -> i32 {
    let mut config = match RoweConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            return 1;
        }
    };
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(db) = db {
        config.db_path = db;
    }

    match rowe_server::start_server(config).await {
        Ok(addr) => {
            println!("rowe server listening on http://{}", addr);
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    println!("shutting down");
                    0
                }
                Err(e) => {
                    eprintln!("signal handling failed: {}", e);
                    1
                }
            }
        }
        Err(e) => {
            eprintln!("server failed to start: {}", e);
            1
        }
    }
}
