//! Object storage for downloaded audio.
//!
//! Keys are deterministic per task and day: `voice/YYYY/MM/DD/<task_id><ext>`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use super::BlobStore;

/// Content type used when the source did not report one
pub const DEFAULT_CONTENT_TYPE: &str = "audio/ogg";

/// File extension for an audio MIME type
pub fn extension_for(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    match essence {
        "audio/mpeg" | "audio/mp3" => ".mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => ".m4a",
        "audio/wav" | "audio/x-wav" | "audio/wave" => ".wav",
        _ => ".ogg",
    }
}

/// Content type to store, falling back to [`DEFAULT_CONTENT_TYPE`]
pub fn content_type_for(mime_type: Option<&str>) -> &str {
    match mime_type {
        Some(m) if !m.trim().is_empty() => m,
        _ => DEFAULT_CONTENT_TYPE,
    }
}

/// Storage key for a task's audio
pub fn object_key(task_id: Uuid, at: DateTime<Utc>, mime_type: Option<&str>) -> String {
    format!(
        "voice/{}/{}{}",
        at.format("%Y/%m/%d"),
        task_id,
        extension_for(content_type_for(mime_type))
    )
}

/// Which blob backend to use
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageSettings {
    /// S3-compatible bucket reached with path-style PUTs
    Http {
        endpoint: String,
        bucket: String,
        /// Base for returned URIs (default: `endpoint`)
        #[serde(default)]
        public_base: Option<String>,
        /// Bearer token for uploads
        #[serde(default)]
        access_token: Option<String>,
    },

    /// Local directory; URIs are `file://` paths
    Filesystem { dir: PathBuf },
}

impl StorageSettings {
    pub fn build(&self) -> Result<Arc<dyn BlobStore>> {
        Ok(match self {
            Self::Http {
                endpoint,
                bucket,
                public_base,
                access_token,
            } => Arc::new(HttpBlobStore::new(
                endpoint.clone(),
                bucket.clone(),
                public_base.clone(),
                access_token.clone(),
            )?),
            Self::Filesystem { dir } => Arc::new(FsBlobStore::new(dir.clone())),
        })
    }
}

// ============================================================================
// HTTP (S3-compatible)
// ============================================================================

pub struct HttpBlobStore {
    endpoint: String,
    bucket: String,
    public_base: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl HttpBlobStore {
    pub fn new(
        endpoint: String,
        bucket: String,
        public_base: Option<String>,
        access_token: Option<String>,
    ) -> Result<Self> {
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let public_base = public_base
            .map(|b| b.trim_end_matches('/').to_string())
            .unwrap_or_else(|| endpoint.clone());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint,
            bucket,
            public_base,
            access_token,
            client,
        })
    }

    fn object_url(&self, base: &str, key: &str) -> String {
        format!("{}/{}/{}", base, self.bucket, key)
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    fn name(&self) -> &str {
        "s3"
    }

    async fn upload(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        let digest = hex::encode(Sha256::digest(bytes));
        let mut request = self
            .client
            .put(self.object_url(&self.endpoint, key))
            .header("Content-Type", content_type)
            .header("x-amz-content-sha256", digest.as_str())
            .body(bytes.to_vec());
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("Failed to upload object")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Upload rejected: status={}, body={}", status, body);
        }

        let url = self.object_url(&self.public_base, key);
        info!(key, size = bytes.len(), "Object uploaded");
        Ok(url)
    }
}

// ============================================================================
// Filesystem
// ============================================================================

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn upload(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            anyhow::bail!("Invalid object key: {}", key);
        }

        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(format!("file://{}", path.display()))
    }
}
