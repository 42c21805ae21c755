//! Process invocation: direct execution and container execution.
//!
//! Both paths share one request shape. Container runs bind-mount the task
//! working directory at a fixed in-container root and rewrite every host
//! path (argv, env, stdio redirects) into that namespace, so a tool sees a
//! consistent filesystem either way.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::cmdline::{self, CommandPart};
use crate::error::TaskFailure;

/// Fixed mount point of the task working directory inside containers.
pub const CONTAINER_ROOT: &str = "/rowe";

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub binary: String,
    pub image: String,
    pub gpus: bool,
    pub network: bool,
}

#[derive(Debug)]
pub struct ExecRequest {
    pub parts: Vec<CommandPart>,
    /// Join argv into one `sh -c` line (ShellCommandRequirement).
    pub shell: bool,
    pub env: Vec<(String, String)>,
    /// Host working directory of the task (the bind-mount root).
    pub work_dir: PathBuf,
    /// Host directory the process starts in (the output directory).
    pub cwd: PathBuf,
    pub stdin: Option<PathBuf>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub timeout_secs: Option<u64>,
    pub container: Option<ContainerSpec>,
}

/// Run the request to completion and return the exit code.
pub async fn execute(request: &ExecRequest) -> Result<i32, TaskFailure> {
    let mut command = build_command(request)?;

    command
        .stdout(Stdio::from(create_capture(&request.stdout)?))
        .stderr(Stdio::from(create_capture(&request.stderr)?));

    match &request.stdin {
        Some(path) => {
            let file = std::fs::File::open(path).map_err(|e| TaskFailure::Exec {
                message: format!("stdin '{}': {}", path.display(), e),
                transient: false,
            })?;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }

    command.kill_on_drop(true);
    let mut child = command.spawn().map_err(|e| {
        let transient = e.kind() != std::io::ErrorKind::NotFound;
        TaskFailure::Exec {
            message: format!("failed to start: {}", e),
            transient,
        }
    })?;

    let status = match request.timeout_secs {
        Some(limit) => {
            match tokio::time::timeout(std::time::Duration::from_secs(limit), child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    child.kill().await.ok();
                    return Err(TaskFailure::Timeout { limit_secs: limit });
                }
            }
        }
        None => child.wait().await,
    }
    .map_err(|e| TaskFailure::Exec {
        message: format!("wait failed: {}", e),
        transient: true,
    })?;

    Ok(status.code().unwrap_or(-1))
}

fn create_capture(path: &Path) -> Result<std::fs::File, TaskFailure> {
    std::fs::File::create(path).map_err(|e| TaskFailure::Exec {
        message: format!("capture '{}': {}", path.display(), e),
        transient: false,
    })
}

fn build_command(request: &ExecRequest) -> Result<Command, TaskFailure> {
    match &request.container {
        None => {
            let tokens: Vec<String> = if request.shell {
                vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    cmdline::shell_join(&request.parts),
                ]
            } else {
                request.parts.iter().map(|p| p.token.clone()).collect()
            };
            let program = tokens.first().ok_or_else(|| TaskFailure::Exec {
                message: "empty command line".to_string(),
                transient: false,
            })?;
            let mut command = Command::new(program);
            command.args(&tokens[1..]);
            command.current_dir(&request.cwd);
            for (name, value) in &request.env {
                command.env(name, value);
            }
            Ok(command)
        }
        Some(container) => {
            let translate = |s: &str| translate_path(s, &request.work_dir);

            let mut argv: Vec<String> = vec![
                "run".to_string(),
                "--rm".to_string(),
                "-v".to_string(),
                format!("{}:{}", request.work_dir.display(), CONTAINER_ROOT),
                "-w".to_string(),
                translate(&request.cwd.display().to_string()),
            ];
            if request.stdin.is_some() {
                argv.push("-i".to_string());
            }
            if container.gpus {
                argv.push("--gpus".to_string());
                argv.push("all".to_string());
            }
            if !container.network {
                argv.push("--network".to_string());
                argv.push("none".to_string());
            }
            for (name, value) in &request.env {
                argv.push("-e".to_string());
                argv.push(format!("{}={}", name, translate(value)));
            }
            argv.push(container.image.clone());

            if request.shell {
                let translated: Vec<CommandPart> = request
                    .parts
                    .iter()
                    .map(|p| CommandPart {
                        token: translate(&p.token),
                        shell_quote: p.shell_quote,
                    })
                    .collect();
                argv.push("/bin/sh".to_string());
                argv.push("-c".to_string());
                argv.push(cmdline::shell_join(&translated));
            } else {
                argv.extend(request.parts.iter().map(|p| translate(&p.token)));
            }

            let mut command = Command::new(&container.binary);
            command.args(&argv);
            Ok(command)
        }
    }
}

/// Rewrite any occurrence of the host working directory into the
/// in-container namespace.
fn translate_path(token: &str, work_dir: &Path) -> String {
    token.replace(&work_dir.display().to_string(), CONTAINER_ROOT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(token: &str) -> CommandPart {
        CommandPart {
            token: token.to_string(),
            shell_quote: true,
        }
    }

    #[tokio::test]
    async fn direct_execution_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let request = ExecRequest {
            parts: vec![part("echo"), part("hello")],
            shell: false,
            env: Vec::new(),
            work_dir: dir.path().to_path_buf(),
            cwd: dir.path().to_path_buf(),
            stdin: None,
            stdout: dir.path().join("out.txt"),
            stderr: dir.path().join("err.txt"),
            timeout_secs: None,
            container: None,
        };
        let code = execute(&request).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "hello\n"
        );
    }

    #[tokio::test]
    async fn timeout_kills_and_classifies() {
        let dir = tempfile::tempdir().unwrap();
        let request = ExecRequest {
            parts: vec![part("sleep"), part("30")],
            shell: false,
            env: Vec::new(),
            work_dir: dir.path().to_path_buf(),
            cwd: dir.path().to_path_buf(),
            stdin: None,
            stdout: dir.path().join("out.txt"),
            stderr: dir.path().join("err.txt"),
            timeout_secs: Some(1),
            container: None,
        };
        match execute(&request).await {
            Err(TaskFailure::Timeout { limit_secs }) => assert_eq!(limit_secs, 1),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_binary_is_a_permanent_exec_failure() {
        let dir = tempfile::tempdir().unwrap();
        let request = ExecRequest {
            parts: vec![part("rowe-no-such-binary")],
            shell: false,
            env: Vec::new(),
            work_dir: dir.path().to_path_buf(),
            cwd: dir.path().to_path_buf(),
            stdin: None,
            stdout: dir.path().join("out.txt"),
            stderr: dir.path().join("err.txt"),
            timeout_secs: None,
            container: None,
        };
        match execute(&request).await {
            Err(TaskFailure::Exec { transient, .. }) => assert!(!transient),
            other => panic!("expected exec failure, got {:?}", other),
        }
    }

    #[test]
    fn container_paths_translate_consistently() {
        assert_eq!(
            translate_path("/work/t1/outdir/file.txt", Path::new("/work/t1")),
            "/rowe/outdir/file.txt"
        );
        assert_eq!(translate_path("unrelated", Path::new("/work/t1")), "unrelated");
    }
}
