//! Artifact storage abstraction.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path};

use crate::{BuildId, Error, Result};

/// Prefix under which every build's output is stored.
pub const OUTPUTS_PREFIX: &str = "outputs";

/// Content type used when the extension is unknown.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Key of a stored artifact: `outputs/<build id>/<relative path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub build_id: BuildId,
    /// Forward-slash separated path relative to the build's output root.
    pub path: String,
}

impl ArtifactKey {
    pub fn new(build_id: BuildId, path: impl Into<String>) -> Self {
        Self {
            build_id,
            path: path.into(),
        }
    }

    /// Build a key from a file path relative to the output directory.
    /// Rejects paths that would escape the build's namespace.
    pub fn from_relative(build_id: BuildId, relative: &Path) -> Result<Self> {
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "artifact path escapes output directory: {}",
                        relative.display()
                    )));
                }
            }
        }
        if segments.is_empty() {
            return Err(Error::InvalidInput("empty artifact path".to_string()));
        }
        Ok(Self::new(build_id, segments.join("/")))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", OUTPUTS_PREFIX, self.build_id, self.path)
    }
}

/// Reference to a stored artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: ArtifactKey,
    /// Storage location (backend-specific).
    pub location: String,
    pub content_type: String,
    /// Size in bytes.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Trait for artifact storage backends.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Store an artifact under `key`.
    async fn put(&self, key: &ArtifactKey, content_type: &str, data: Bytes) -> Result<ArtifactRef>;
}

/// Content type inferred from the file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") | Some("mjs") | Some("cjs") => "application/javascript",
        Some("json") | Some("map") => "application/json",
        Some("txt") | Some("log") => "text/plain",
        Some("xml") => "application/xml",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("wasm") => "application/wasm",
        Some("pdf") => "application/pdf",
        Some("webmanifest") => "application/manifest+json",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        _ => DEFAULT_CONTENT_TYPE,
    }
}
