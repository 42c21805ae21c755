//! Output collection: globbing, metadata, `cwl.output.json`.

use std::path::Path;

use serde_json::{Map, Value};
use sha1::{Digest, Sha1};

use crate::cwl::{CwlType, Tool};
use crate::error::TaskFailure;
use crate::expression::{self, ExprContext};

/// `loadContents` reads at most this much.
pub const CONTENTS_LIMIT: u64 = 64 * 1024;

/// Build a File value for a path on disk: location, path, basename,
/// nameroot, nameext, size, and the sha1 checksum.
pub fn file_value(path: &Path) -> Result<Value, TaskFailure> {
    let metadata = std::fs::metadata(path).map_err(|e| TaskFailure::OutputCollection {
        message: format!("stat '{}': {}", path.display(), e),
    })?;
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let (nameroot, nameext) = split_name(&basename);

    let mut map = Map::new();
    map.insert("class".to_string(), Value::String("File".to_string()));
    map.insert(
        "location".to_string(),
        Value::String(format!("file://{}", path.display())),
    );
    map.insert(
        "path".to_string(),
        Value::String(path.display().to_string()),
    );
    map.insert("basename".to_string(), Value::String(basename));
    map.insert("nameroot".to_string(), Value::String(nameroot));
    map.insert("nameext".to_string(), Value::String(nameext));
    map.insert("size".to_string(), Value::Number(metadata.len().into()));
    map.insert("checksum".to_string(), Value::String(checksum(path)?));
    Ok(Value::Object(map))
}

pub fn directory_value(path: &Path) -> Value {
    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    serde_json::json!({
        "class": "Directory",
        "location": format!("file://{}", path.display()),
        "path": path.display().to_string(),
        "basename": basename,
    })
}

/// `"sha1$" + hex` over the file contents, streamed.
pub fn checksum(path: &Path) -> Result<String, TaskFailure> {
    use std::io::Read;

    let mut file = std::fs::File::open(path).map_err(|e| TaskFailure::OutputCollection {
        message: format!("open '{}': {}", path.display(), e),
    })?;
    let mut hasher = Sha1::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).map_err(|e| TaskFailure::OutputCollection {
            message: format!("read '{}': {}", path.display(), e),
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("sha1${}", hex::encode(hasher.finalize())))
}

/// `(nameroot, nameext)` split on the final dot.
fn split_name(basename: &str) -> (String, String) {
    match basename.rfind('.') {
        Some(0) | None => (basename.to_string(), String::new()),
        Some(i) => (basename[..i].to_string(), basename[i..].to_string()),
    }
}

/// Read the first `CONTENTS_LIMIT` bytes into the File value's `contents`.
pub fn load_contents(file: &mut Map<String, Value>) -> Result<(), TaskFailure> {
    use std::io::Read;

    let Some(path) = file.get("path").and_then(Value::as_str) else {
        return Ok(());
    };
    let handle = std::fs::File::open(path).map_err(|e| TaskFailure::OutputCollection {
        message: format!("open '{}': {}", path, e),
    })?;
    let mut bytes = Vec::new();
    handle
        .take(CONTENTS_LIMIT)
        .read_to_end(&mut bytes)
        .map_err(|e| TaskFailure::OutputCollection {
            message: format!("read '{}': {}", path, e),
        })?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    file.insert("contents".to_string(), Value::String(text));
    Ok(())
}

/// Collect every declared output of a finished tool run.
///
/// `ctx` carries inputs and a runtime scope whose `exitCode` is populated.
/// When the tool wrote `cwl.output.json` into the output directory, its
/// values win for overlapping keys; glob-derived values fill the rest.
pub fn collect(
    tool: &Tool,
    outdir: &Path,
    stdout_name: &str,
    stderr_name: &str,
    ctx: &ExprContext,
) -> Result<Map<String, Value>, TaskFailure> {
    let mut declared: Map<String, Value> = Map::new();

    let override_map: Map<String, Value> = {
        let path = outdir.join("cwl.output.json");
        if path.exists() {
            let text = std::fs::read_to_string(&path).map_err(|e| TaskFailure::OutputCollection {
                message: format!("cwl.output.json: {}", e),
            })?;
            serde_json::from_str(&text).map_err(|e| TaskFailure::OutputCollection {
                message: format!("cwl.output.json: {}", e),
            })?
        } else {
            Map::new()
        }
    };

    for output in &tool.outputs {
        if let Some(value) = override_map.get(&output.id) {
            declared.insert(output.id.clone(), resolve_override(value, outdir)?);
            continue;
        }

        match output.r#type.unwrap_optional() {
            CwlType::Stdout => {
                declared.insert(output.id.clone(), file_value(&outdir.join(stdout_name))?);
                continue;
            }
            CwlType::Stderr => {
                declared.insert(output.id.clone(), file_value(&outdir.join(stderr_name))?);
                continue;
            }
            _ => {}
        }

        let Some(binding) = &output.binding else {
            declared.insert(output.id.clone(), Value::Null);
            continue;
        };

        // Evaluate each glob pattern, then match under the output directory
        // (the only visible output root), sorted lexicographically.
        let mut matches: Vec<std::path::PathBuf> = Vec::new();
        for pattern in &binding.glob {
            let evaluated = expression::evaluate(pattern, ctx)?;
            let patterns: Vec<String> = match evaluated {
                Value::String(s) => vec![s],
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                Value::Null => Vec::new(),
                other => vec![expression::coerce_string(&other)],
            };
            for p in patterns {
                let full = outdir.join(&p);
                let found =
                    glob::glob(&full.display().to_string()).map_err(|e| TaskFailure::OutputCollection {
                        message: format!("glob '{}': {}", p, e),
                    })?;
                for entry in found {
                    match entry {
                        Ok(path) => matches.push(path),
                        Err(e) => {
                            return Err(TaskFailure::OutputCollection {
                                message: format!("glob '{}': {}", p, e),
                            })
                        }
                    }
                }
            }
        }
        matches.sort();
        matches.dedup();

        let mut values: Vec<Value> = Vec::new();
        for path in &matches {
            if path.is_dir() {
                values.push(directory_value(path));
            } else {
                let mut file = match file_value(path)? {
                    Value::Object(m) => m,
                    _ => unreachable!(),
                };
                if binding.load_contents {
                    load_contents(&mut file)?;
                }
                values.push(Value::Object(file));
            }
        }

        let mut value = match output.r#type.unwrap_optional() {
            CwlType::Array(_) => Value::Array(values),
            _ => match values.len() {
                0 => Value::Null,
                1 => values.into_iter().next().unwrap(),
                _ => Value::Array(values),
            },
        };

        if let Some(eval) = &binding.output_eval {
            let scoped = ctx.clone().with_self(value.clone());
            value = expression::evaluate(eval, &scoped)?;
        }

        if value.is_null() && !output.r#type.is_optional() {
            return Err(TaskFailure::OutputCollection {
                message: format!(
                    "output '{}': glob {:?} matched nothing",
                    output.id, binding.glob
                ),
            });
        }

        declared.insert(output.id.clone(), value);
    }

    Ok(declared)
}

/// Values from `cwl.output.json` may name files relative to the output
/// directory; flesh File entries out with metadata.
fn resolve_override(value: &Value, outdir: &Path) -> Result<Value, TaskFailure> {
    match value {
        Value::Object(map) if map.get("class").and_then(Value::as_str) == Some("File") => {
            let reference = map
                .get("path")
                .or_else(|| map.get("location"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let reference = reference.strip_prefix("file://").unwrap_or(reference);
            let path = if Path::new(reference).is_absolute() {
                std::path::PathBuf::from(reference)
            } else {
                outdir.join(reference)
            };
            file_value(&path)
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve_override(item, outdir)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_known_sha1() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, "hello\n").unwrap();
        assert_eq!(
            checksum(&path).unwrap(),
            "sha1$f572d396fae9206628714fb2ce00f72e94f2258f"
        );
    }

    #[test]
    fn file_value_populates_name_parts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads.fastq.gz");
        std::fs::write(&path, "x").unwrap();
        let value = file_value(&path).unwrap();
        assert_eq!(value["basename"], "reads.fastq.gz");
        assert_eq!(value["nameroot"], "reads.fastq");
        assert_eq!(value["nameext"], ".gz");
        assert_eq!(value["size"], 1);
    }

    #[test]
    fn load_contents_caps_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "a".repeat(100 * 1024)).unwrap();
        let mut file = match file_value(&path).unwrap() {
            Value::Object(m) => m,
            _ => unreachable!(),
        };
        load_contents(&mut file).unwrap();
        assert_eq!(
            file["contents"].as_str().unwrap().len() as u64,
            CONTENTS_LIMIT
        );
    }
}
