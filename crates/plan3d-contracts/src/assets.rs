use std::fmt;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Where the bytes of an image or mesh live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AssetRef {
    Local(PathBuf),
    Remote(String),
    Inline(String),
}

impl AssetRef {
    /// `data:` prefix is inline, `http(s)://` is remote, everything else a local path.
    pub fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.starts_with("data:") {
            return Self::Inline(trimmed.to_string());
        }
        let lowered = trimmed.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            return Self::Remote(trimmed.to_string());
        }
        Self::Local(PathBuf::from(trimmed))
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self::Remote(url.into())
    }

    pub fn inline_png(bytes: &[u8]) -> Self {
        Self::Inline(data_url("image/png", bytes))
    }

    /// True when a remote service can consume the reference without an upload step.
    pub fn is_transferable(&self) -> bool {
        !matches!(self, Self::Local(_))
    }

    pub fn as_url(&self) -> Option<&str> {
        match self {
            Self::Remote(url) | Self::Inline(url) => Some(url.as_str()),
            Self::Local(_) => None,
        }
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path.as_path()),
            _ => None,
        }
    }

    /// Short label for logs; inline payloads are not echoed.
    pub fn label(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::Remote(url) => url.clone(),
            Self::Inline(url) => {
                let mime = url
                    .strip_prefix("data:")
                    .and_then(|rest| rest.split(';').next())
                    .filter(|value| !value.is_empty())
                    .unwrap_or("application/octet-stream");
                format!("inline {mime} ({} bytes)", url.len())
            }
        }
    }
}

impl fmt::Display for AssetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

pub fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "bmp" => Some("image/bmp"),
        "glb" => Some("model/gltf-binary"),
        _ => None,
    }
}
