//! Artifact sinks: where build output ends up.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use shipit_config::ArtifactsConfig;
use shipit_core::artifact::{ArtifactKey, ArtifactRef, ArtifactSink, OUTPUTS_PREFIX};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload of {key} failed: {source}")]
    Http {
        key: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid artifact base url: {0}")]
    BaseUrl(String),
}

impl From<ArtifactError> for shipit_core::Error {
    fn from(err: ArtifactError) -> Self {
        shipit_core::Error::Artifact(err.to_string())
    }
}

/// Build the configured sink.
pub fn sink_from_config(config: &ArtifactsConfig) -> Result<Arc<dyn ArtifactSink>, ArtifactError> {
    Ok(match config {
        ArtifactsConfig::Fs { root } => Arc::new(FsArtifactSink::new(root.clone())),
        ArtifactsConfig::Http { base_url } => Arc::new(HttpArtifactSink::new(base_url)?),
    })
}

/// Stores artifacts as files under a root directory.
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// File path for `key`.
    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        let mut path = self.root.join(OUTPUTS_PREFIX).join(key.build_id.as_str());
        for segment in key.path.split('/') {
            path.push(segment);
        }
        path
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    fn name(&self) -> &'static str {
        "fs"
    }

    async fn put(
        &self,
        key: &ArtifactKey,
        content_type: &str,
        data: Bytes,
    ) -> shipit_core::Result<ArtifactRef> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ArtifactError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let size = data.len() as u64;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|source| ArtifactError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(key = %key, path = %path.display(), size, "Stored artifact");
        Ok(ArtifactRef {
            key: key.clone(),
            location: path.display().to_string(),
            content_type: content_type.to_string(),
            size,
            created_at: Utc::now(),
        })
    }
}

/// Stores artifacts with `PUT <base_url>/<key>`, which fits S3-compatible
/// stores behind presigned or open buckets.
pub struct HttpArtifactSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtifactSink {
    pub fn new(base_url: &str) -> Result<Self, ArtifactError> {
        url::Url::parse(base_url).map_err(|e| ArtifactError::BaseUrl(e.to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Object URL for `key`, with every path segment percent-encoded.
    pub fn url_for(&self, key: &ArtifactKey) -> String {
        let encoded: Vec<String> = key
            .to_string()
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!("{}/{}", self.base_url, encoded.join("/"))
    }
}

#[async_trait]
impl ArtifactSink for HttpArtifactSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn put(
        &self,
        key: &ArtifactKey,
        content_type: &str,
        data: Bytes,
    ) -> shipit_core::Result<ArtifactRef> {
        let url = self.url_for(key);
        let size = data.len() as u64;
        let to_error = |source| ArtifactError::Http {
            key: key.to_string(),
            source,
        };

        self.client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .map_err(to_error)?
            .error_for_status()
            .map_err(to_error)?;

        debug!(key = %key, url = %url, size, "Uploaded artifact");
        Ok(ArtifactRef {
            key: key.clone(),
            location: url,
            content_type: content_type.to_string(),
            size,
            created_at: Utc::now(),
        })
    }
}
