//! `s3://bucket/key` staging via the AWS SDK. Compiled only with the `s3`
//! feature.

use std::path::{Path, PathBuf};

use crate::error::TaskFailure;

use super::SchemeStager;

fn split_uri(uri: &str) -> Result<(&str, &str), TaskFailure> {
    let rest = uri.strip_prefix("s3://").ok_or_else(|| TaskFailure::Staging {
        message: format!("'{}' is not an s3 URI", uri),
        transient: false,
    })?;
    rest.split_once('/').ok_or_else(|| TaskFailure::Staging {
        message: format!("'{}' is missing an object key", uri),
        transient: false,
    })
}

impl SchemeStager {
    async fn s3_client(&self) -> &aws_sdk_s3::Client {
        self.s3
            .get_or_init(|| async {
                let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                aws_sdk_s3::Client::new(&config)
            })
            .await
    }

    pub(super) async fn stage_in_s3(
        &self,
        uri: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, TaskFailure> {
        let (bucket, key) = split_uri(uri)?;
        let client = self.s3_client().await;
        let object = client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| TaskFailure::Staging {
                message: format!("GET {}: {}", uri, e),
                transient: true,
            })?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| TaskFailure::Staging {
                message: format!("GET {}: {}", uri, e),
                transient: true,
            })?
            .into_bytes();
        let dest = Self::dest_file(dest_dir, uri);
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|e| TaskFailure::Staging {
                message: format!("write {}: {}", dest.display(), e),
                transient: false,
            })?;
        Ok(dest)
    }

    pub(super) async fn stage_out_s3(
        &self,
        local: &Path,
        uri: &str,
    ) -> Result<String, TaskFailure> {
        let (bucket, key) = split_uri(uri)?;
        let body = aws_sdk_s3::primitives::ByteStream::from_path(local)
            .await
            .map_err(|e| TaskFailure::Staging {
                message: format!("read {}: {}", local.display(), e),
                transient: false,
            })?;
        self.s3_client()
            .await
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| TaskFailure::Staging {
                message: format!("PUT {}: {}", uri, e),
                transient: true,
            })?;
        Ok(uri.to_string())
    }
}
