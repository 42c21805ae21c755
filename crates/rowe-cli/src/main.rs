//! Rowe CLI — CWL workflow engine.
//!
//! Three ways in:
//!   `rowe server`  — run the HTTP backend with the scheduler loop
//!   `rowe run`     — execute one CWL document locally, outputs JSON on stdout
//!   `rowe worker`  — join a server as a pull-based worker daemon

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rowe", version, about = "Rowe — CWL workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Rowe HTTP backend server
    Server {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Path to the SQLite database file
        #[arg(long, env = "ROWE_DB_PATH")]
        db: Option<String>,
    },

    /// Run one CWL tool or workflow locally and print its outputs as JSON
    Run {
        /// Path to the CWL document (YAML or JSON)
        tool: std::path::PathBuf,
        /// Path to the job inputs file (YAML or JSON)
        inputs: Option<std::path::PathBuf>,
        /// Working directory base (defaults to a temp dir)
        #[arg(long)]
        work_dir: Option<std::path::PathBuf>,
    },

    /// Run as a pull-based worker against a Rowe server
    Worker {
        /// Server base URL, e.g. http://127.0.0.1:8472
        #[arg(long, env = "ROWE_SERVER_URL")]
        server: String,
        /// Worker display name
        #[arg(long)]
        name: Option<String>,
        /// Runtime this worker offers: direct, container, or container-alt
        #[arg(long, default_value = "direct")]
        runtime: String,
        /// Steering group label
        #[arg(long, default_value = "")]
        group: String,
        /// Advertised core count
        #[arg(long, default_value_t = 1)]
        cores: i64,
        /// Advertised memory in bytes
        #[arg(long, default_value_t = 0)]
        memory: i64,
        /// Seconds between heartbeats
        #[arg(long, default_value_t = 30)]
        heartbeat_secs: u64,
        /// Seconds between checkout polls when idle
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit = match cli.command {
        Commands::Server { host, port, db } => commands::server(host, port, db).await,
        Commands::Run {
            tool,
            inputs,
            work_dir,
        } => commands::run::execute(tool, inputs, work_dir).await,
        Commands::Worker {
            server,
            name,
            runtime,
            group,
            cores,
            memory,
            heartbeat_secs,
            poll_secs,
        } => {
            commands::worker::execute(commands::worker::WorkerArgs {
                server,
                name,
                runtime,
                group,
                cores,
                memory,
                heartbeat_secs,
                poll_secs,
            })
            .await
        }
    };
    std::process::exit(exit);
}
