//! [`ObjectStore`] backed by a real S3-compatible bucket.

use crate::ObjectStore;
use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use kilnforge_core::{Error, ObjectStorageConfig, Result};
use tracing::{instrument, warn};

/// An S3 (or S3-compatible) bucket implementing [`ObjectStore`].
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client from `config` and bind it to `config.bucket`.
    pub async fn connect(config: &ObjectStorageConfig) -> Result<Self> {
        let mut loader =
            aws_config::defaults(aws_config::BehaviorVersion::latest()).region(Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let shared_config = loader.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&shared_config);
        if config.path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(S3Store {
            client: Client::from_conf(s3_config.build()),
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, value), fields(bucket = %self.bucket, key, len = value.len()))]
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(value))
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("put {key}: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(resp) => {
                let bytes = resp
                    .body
                    .collect()
                    .await
                    .map_err(|e| Error::ObjectStore(format!("read body {key}: {e}")))?
                    .into_bytes();
                Ok(Some(bytes.to_vec()))
            }
            Err(e) => {
                if is_not_found(&e) {
                    Ok(None)
                } else {
                    Err(Error::ObjectStore(format!("get {key}: {e}")))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
            if let Some(token) = continuation_token.take() {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| Error::ObjectStore(format!("list {prefix}: {e}")))?;

            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation_token = resp.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    warn!(prefix, "truncated listing without a continuation token");
                    break;
                }
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::ObjectStore(format!("delete {key}: {e}")))?;
        Ok(())
    }
}

fn is_not_found<E: std::fmt::Debug>(err: &aws_sdk_s3::error::SdkError<E>) -> bool {
    matches!(
        err,
        aws_sdk_s3::error::SdkError::ServiceError(_)
    ) && format!("{err:?}").contains("NoSuchKey")
}
