//! `rowe run` — the standalone single-document runner.
//!
//! Parses one CWL document, executes it locally through the same engine the
//! server uses, and prints the result document (declared outputs → values)
//! as JSON on stdout, matching what the conformance harness expects.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use rowe_core::cwl::{self, Process};
use rowe_core::engine::{RunnerConfig, RuntimeKind, ToolRunner};
use rowe_core::error::ServerError;
use rowe_core::stager::{SchemeStager, StagingCredentials};

pub async fn execute(
    tool_path: PathBuf,
    inputs_path: Option<PathBuf>,
    work_dir: Option<PathBuf>,
) -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run_document(&tool_path, inputs_path.as_deref(), work_dir).await {
        Ok(outputs) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&Value::Object(outputs)).unwrap_or_default()
            );
            0
        }
        Err(ServerError::Validation(errors)) => {
            eprintln!("{} is not valid:", tool_path.display());
            for error in errors {
                eprintln!("  - {}", error);
            }
            1
        }
        Err(e) => {
            eprintln!("execution failed: {}", e);
            1
        }
    }
}

async fn run_document(
    tool_path: &Path,
    inputs_path: Option<&Path>,
    work_dir: Option<PathBuf>,
) -> Result<Map<String, Value>, ServerError> {
    let text = std::fs::read_to_string(tool_path)
        .map_err(|e| ServerError::BadRequest(format!("{}: {}", tool_path.display(), e)))?;
    let spec = cwl::parse_document(&text, tool_path.parent())?;

    let mut job: Map<String, Value> = match inputs_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ServerError::BadRequest(format!("{}: {}", path.display(), e)))?;
            let yaml: serde_yaml::Value = serde_yaml::from_str(&text)
                .map_err(|e| ServerError::BadRequest(format!("{}: {}", path.display(), e)))?;
            let value: Value = serde_json::to_value(yaml)
                .map_err(|e| ServerError::BadRequest(format!("{}: {}", path.display(), e)))?;
            match value {
                Value::Object(map) => map,
                Value::Null => Map::new(),
                _ => {
                    return Err(ServerError::BadRequest(
                        "job inputs must be a mapping".to_string(),
                    ))
                }
            }
        }
        None => Map::new(),
    };

    // relative File locations in the job resolve against the job file
    let base = inputs_path
        .and_then(Path::parent)
        .unwrap_or_else(|| Path::new("."));
    for value in job.values_mut() {
        absolutize_files(value, base);
    }

    let work_base = match work_dir {
        Some(dir) => dir,
        None => std::env::temp_dir().join(format!("rowe-run-{}", uuid::Uuid::new_v4())),
    };
    let runner = ToolRunner::new(
        Arc::new(SchemeStager::new(StagingCredentials::default(), None)),
        RunnerConfig {
            work_base,
            ..Default::default()
        },
    );

    // the workflow driver picks the runtime per step: containers engage for
    // steps that declare an image
    let outcome = runner
        .run(
            &Process::Workflow(Box::new(spec)),
            &job,
            "run",
            RuntimeKind::Local,
            None,
        )
        .await
        .map_err(|f| ServerError::Internal(f.to_string()))?;

    match outcome.failure {
        Some(failure) => Err(ServerError::Internal(failure.to_string())),
        None => Ok(outcome.outputs),
    }
}

/// Make relative `location`/`path` fields absolute against the job file's
/// directory, recursively.
fn absolutize_files(value: &mut Value, base: &Path) {
    match value {
        Value::Array(items) => {
            for item in items {
                absolutize_files(item, base);
            }
        }
        Value::Object(map) => {
            let is_fileish = matches!(
                map.get("class").and_then(Value::as_str),
                Some("File") | Some("Directory")
            );
            if is_fileish {
                for key in ["location", "path"] {
                    if let Some(Value::String(reference)) = map.get(key) {
                        if !reference.contains("://") && !Path::new(reference).is_absolute() {
                            let absolute = base.join(reference);
                            map.insert(
                                key.to_string(),
                                Value::String(absolute.display().to_string()),
                            );
                        }
                    }
                }
            } else {
                for nested in map.values_mut() {
                    absolutize_files(nested, base);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_document_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("echo.cwl");
        std::fs::write(
            &tool,
            r#"
cwlVersion: v1.2
class: CommandLineTool
baseCommand: [echo]
inputs:
  message:
    type: string
    inputBinding:
      position: 1
outputs:
  out:
    type: stdout
stdout: output.txt
"#,
        )
        .unwrap();
        let inputs = dir.path().join("job.yaml");
        std::fs::write(&inputs, "message: hello\n").unwrap();

        let outputs = run_document(&tool, Some(inputs.as_path()), Some(dir.path().join("work")))
            .await
            .unwrap();
        assert_eq!(
            outputs["out"]["checksum"],
            "sha1$f572d396fae9206628714fb2ce00f72e94f2258f"
        );
    }
}
