//! Data movement between URIs and local paths.
//!
//! The execution engine sees one interface: `stage_in(uri) → local path` and
//! `stage_out(local path, uri) → final URI`, with one implementation per URI
//! scheme. Staging out is idempotent: re-running against the same
//! destination overwrites.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TaskFailure;

#[cfg(feature = "s3")]
mod s3;

/// Credentials a caller is authorized to forward for staging. Scoped per
/// submission; workers receive these in the checkout body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StagingCredentials {
    /// Bearer token for http(s) sources and destinations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_bearer: Option<String>,
    /// Token for remote-service workspace reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_token: Option<String>,
}

#[async_trait]
pub trait Stager: Send + Sync {
    /// Make the resource at `uri` readable at a local path under `dest_dir`.
    async fn stage_in(&self, uri: &str, dest_dir: &Path) -> Result<PathBuf, TaskFailure>;

    /// Publish a local file to `uri`; returns the final location.
    async fn stage_out(&self, local: &Path, uri: &str) -> Result<String, TaskFailure>;
}

/// Dispatches on the URI scheme. `file://` (and bare paths) always work;
/// `http(s)://` uses the shared HTTP client; workspace URIs go through the
/// remote service when one is configured.
pub struct SchemeStager {
    http: reqwest::Client,
    credentials: StagingCredentials,
    workspace: Option<Arc<crate::bvbrc::BvbrcClient>>,
    #[cfg(feature = "s3")]
    s3: tokio::sync::OnceCell<aws_sdk_s3::Client>,
}

impl SchemeStager {
    pub fn new(
        credentials: StagingCredentials,
        workspace: Option<Arc<crate::bvbrc::BvbrcClient>>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            workspace,
            #[cfg(feature = "s3")]
            s3: tokio::sync::OnceCell::new(),
        }
    }

    fn dest_file(dest_dir: &Path, uri: &str) -> PathBuf {
        let name = uri
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or("staged");
        dest_dir.join(name)
    }

    async fn stage_in_file(&self, uri: &str, dest_dir: &Path) -> Result<PathBuf, TaskFailure> {
        let source = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
        let dest = Self::dest_file(dest_dir, uri);
        let source_clone = source.clone();
        let dest_clone = dest.clone();
        tokio::task::spawn_blocking(move || {
            if dest_clone.exists() {
                std::fs::remove_file(&dest_clone).ok();
            }
            if source_clone.is_dir() {
                return copy_dir(&source_clone, &dest_clone);
            }
            // hard link when the filesystem allows it, copy otherwise
            if std::fs::hard_link(&source_clone, &dest_clone).is_err() {
                std::fs::copy(&source_clone, &dest_clone).map(|_| ())?;
            }
            Ok(())
        })
        .await
        .map_err(|e| TaskFailure::Staging {
            message: format!("join error: {}", e),
            transient: true,
        })?
        .map_err(|e: std::io::Error| TaskFailure::Staging {
            message: format!("'{}': {}", source.display(), e),
            transient: false,
        })?;
        Ok(dest)
    }

    async fn stage_in_http(&self, uri: &str, dest_dir: &Path) -> Result<PathBuf, TaskFailure> {
        let mut request = self.http.get(uri);
        if let Some(token) = &self.credentials.http_bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| TaskFailure::Staging {
            message: format!("GET {}: {}", uri, e),
            transient: true,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TaskFailure::Staging {
                message: format!("GET {}: HTTP {}", uri, status),
                // a hard 4xx will not heal on retry
                transient: !status.is_client_error(),
            });
        }
        let bytes = response.bytes().await.map_err(|e| TaskFailure::Staging {
            message: format!("GET {}: {}", uri, e),
            transient: true,
        })?;
        let dest = Self::dest_file(dest_dir, uri);
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|e| TaskFailure::Staging {
                message: format!("write {}: {}", dest.display(), e),
                transient: false,
            })?;
        Ok(dest)
    }

    async fn stage_in_workspace(&self, uri: &str, dest_dir: &Path) -> Result<PathBuf, TaskFailure> {
        let client = self.workspace.as_ref().ok_or_else(|| TaskFailure::Staging {
            message: format!("workspace URI '{}' but no remote service is configured", uri),
            transient: false,
        })?;
        let path = uri.strip_prefix("ws:").unwrap_or(uri).trim_start_matches('/');
        let bytes = client.workspace_get(&format!("/{}", path)).await?;
        let dest = Self::dest_file(dest_dir, uri);
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|e| TaskFailure::Staging {
                message: format!("write {}: {}", dest.display(), e),
                transient: false,
            })?;
        Ok(dest)
    }

    async fn stage_out_http(&self, local: &Path, uri: &str) -> Result<String, TaskFailure> {
        let bytes = tokio::fs::read(local).await.map_err(|e| TaskFailure::Staging {
            message: format!("read {}: {}", local.display(), e),
            transient: false,
        })?;
        let mut request = self.http.put(uri).body(bytes);
        if let Some(token) = &self.credentials.http_bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| TaskFailure::Staging {
            message: format!("PUT {}: {}", uri, e),
            transient: true,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TaskFailure::Staging {
                message: format!("PUT {}: HTTP {}", uri, status),
                transient: !status.is_client_error(),
            });
        }
        Ok(uri.to_string())
    }
}

#[async_trait]
impl Stager for SchemeStager {
    async fn stage_in(&self, uri: &str, dest_dir: &Path) -> Result<PathBuf, TaskFailure> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            self.stage_in_http(uri, dest_dir).await
        } else if uri.starts_with("ws:") {
            self.stage_in_workspace(uri, dest_dir).await
        } else if uri.starts_with("s3://") {
            #[cfg(feature = "s3")]
            {
                return self.stage_in_s3(uri, dest_dir).await;
            }
            #[cfg(not(feature = "s3"))]
            Err(TaskFailure::Staging {
                message: format!("'{}': s3 support is not built in", uri),
                transient: false,
            })
        } else {
            self.stage_in_file(uri, dest_dir).await
        }
    }

    async fn stage_out(&self, local: &Path, uri: &str) -> Result<String, TaskFailure> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            self.stage_out_http(local, uri).await
        } else if uri.starts_with("s3://") {
            #[cfg(feature = "s3")]
            {
                return self.stage_out_s3(local, uri).await;
            }
            #[cfg(not(feature = "s3"))]
            Err(TaskFailure::Staging {
                message: format!("'{}': s3 support is not built in", uri),
                transient: false,
            })
        } else {
            let dest = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            tokio::fs::copy(local, &dest)
                .await
                .map_err(|e| TaskFailure::Staging {
                    message: format!("copy to {}: {}", dest.display(), e),
                    transient: false,
                })?;
            Ok(format!("file://{}", dest.display()))
        }
    }
}

fn copy_dir(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_stage_in_links_or_copies() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("data.txt");
        std::fs::write(&src, "payload").unwrap();

        let stager = SchemeStager::new(StagingCredentials::default(), None);
        let staged = stager
            .stage_in(&format!("file://{}", src.display()), dest_dir.path())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&staged).unwrap(), "payload");
        assert_eq!(staged.file_name().unwrap(), "data.txt");
    }

    #[tokio::test]
    async fn file_stage_out_overwrites_idempotently() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let local = work.path().join("result.txt");
        std::fs::write(&local, "v1").unwrap();
        let dest = format!("file://{}/result.txt", out.path().display());

        let stager = SchemeStager::new(StagingCredentials::default(), None);
        stager.stage_out(&local, &dest).await.unwrap();
        std::fs::write(&local, "v2").unwrap();
        let final_uri = stager.stage_out(&local, &dest).await.unwrap();

        assert_eq!(final_uri, dest);
        assert_eq!(
            std::fs::read_to_string(out.path().join("result.txt")).unwrap(),
            "v2"
        );
    }
}
