//! AWS S3 implementation of the object store gateway

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    Client,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::ObjectStore;
use crate::error::{PipelineError, PipelineResult};

/// Connection settings for the S3-compatible bucket holding RIF data sets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> PipelineResult<Self> {
        Ok(Self {
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            bucket: std::env::var("S3_BUCKET")
                .map_err(|_| PipelineError::Config("S3_BUCKET not set".to_string()))?,
            access_key: std::env::var("S3_ACCESS_KEY")
                .or_else(|_| std::env::var("AWS_ACCESS_KEY_ID"))
                .map_err(|_| {
                    PipelineError::Config(
                        "S3_ACCESS_KEY or AWS_ACCESS_KEY_ID must be set".to_string(),
                    )
                })?,
            secret_key: std::env::var("S3_SECRET_KEY")
                .or_else(|_| std::env::var("AWS_SECRET_ACCESS_KEY"))
                .map_err(|_| {
                    PipelineError::Config(
                        "S3_SECRET_KEY or AWS_SECRET_ACCESS_KEY must be set".to_string(),
                    )
                })?,
            path_style: std::env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }
}

/// [`ObjectStore`] backed by the AWS SDK.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: StorageConfig) -> PipelineResult<Self> {
        debug!(bucket = %config.bucket, region = %config.region, "Initializing S3 client");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "rif-pipeline",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, "S3 client initialized");

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_keys_with_prefix(&self, prefix: &str) -> PipelineResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let page = request.send().await.map_err(PipelineError::object_store)?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match page.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(prefix, count = keys.len(), "Listed object keys");
        Ok(keys)
    }

    async fn read_object(&self, key: &str) -> PipelineResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(PipelineError::object_store)?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| PipelineError::ObjectStore(format!("reading body of '{key}': {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn download_to_file(&self, key: &str, dest: &Path) -> PipelineResult<u64> {
        let mut response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(PipelineError::object_store)?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut bytes_written: u64 = 0;
        while let Some(chunk) = response.body.try_next().await.map_err(|e| {
            PipelineError::ObjectStore(format!("streaming body of '{key}': {e}"))
        })? {
            bytes_written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!(key, bytes = bytes_written, dest = %dest.display(), "Downloaded object");
        Ok(bytes_written)
    }

    async fn object_size(&self, key: &str) -> PipelineResult<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(PipelineError::object_store)?;
        let length = head.content_length().unwrap_or(0);
        u64::try_from(length).map_err(|_| {
            PipelineError::ObjectStore(format!("negative content length {length} for '{key}'"))
        })
    }

    async fn copy_object(&self, from_key: &str, to_key: &str) -> PipelineResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, from_key))
            .key(to_key)
            .send()
            .await
            .map_err(PipelineError::object_store)?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> PipelineResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(PipelineError::object_store)?;
        Ok(())
    }
}
