use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use plan3d_contracts::assets::AssetRef;
use reqwest::blocking::Client as HttpClient;
use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::adapter::truncate_text;

/// Routes remote asset URLs through `<proxy_base>/proxy?url=...` when a proxy is set.
pub fn proxied_url(proxy_base: Option<&str>, url: &str) -> String {
    let Some(base) = proxy_base
        .map(|value| value.trim().trim_end_matches('/'))
        .filter(|value| !value.is_empty())
    else {
        return url.to_string();
    };
    let lowered = url.trim().to_ascii_lowercase();
    if !(lowered.starts_with("http://") || lowered.starts_with("https://")) {
        return url.to_string();
    }
    match Url::parse_with_params(&format!("{base}/proxy"), &[("url", url.trim())]) {
        Ok(proxied) => proxied.to_string(),
        Err(_) => url.to_string(),
    }
}

/// Downloads meshes and images, optionally through the asset proxy.
#[derive(Debug, Clone)]
pub struct AssetFetcher {
    proxy_base: Option<String>,
    http: HttpClient,
}

impl AssetFetcher {
    pub fn new(proxy_base: Option<String>) -> Self {
        Self {
            proxy_base,
            http: HttpClient::new(),
        }
    }

    /// Raw bytes plus the content type when the source reports one.
    pub fn fetch_bytes(&self, asset: &AssetRef) -> Result<(Vec<u8>, Option<String>)> {
        match asset {
            AssetRef::Local(path) => {
                let bytes =
                    fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
                Ok((bytes, None))
            }
            AssetRef::Inline(url) => decode_data_url(url),
            AssetRef::Remote(url) => {
                let target = proxied_url(self.proxy_base.as_deref(), url);
                let response = self
                    .http
                    .get(&target)
                    .send()
                    .with_context(|| format!("failed downloading asset ({target})"))?;
                if !response.status().is_success() {
                    let code = response.status().as_u16();
                    let body = response.text().unwrap_or_default();
                    bail!(
                        "asset download failed ({code}): {}",
                        truncate_text(&body, 512)
                    );
                }
                let mime_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let bytes = response
                    .bytes()
                    .context("failed reading asset bytes")?
                    .to_vec();
                Ok((bytes, mime_type))
            }
        }
    }

    /// Writes the asset into `dir` as `mesh-<sha256 prefix>.<ext>`.
    pub fn download(&self, asset: &AssetRef, dir: &Path) -> Result<PathBuf> {
        let (bytes, mime_type) = self.fetch_bytes(asset)?;
        if bytes.is_empty() {
            bail!("asset {} is empty", asset.label());
        }
        fs::create_dir_all(dir).with_context(|| format!("failed creating {}", dir.display()))?;
        let ext = asset_extension(asset, mime_type.as_deref());
        let path = dir.join(format!("mesh-{}.{ext}", content_digest(&bytes)));
        fs::write(&path, &bytes).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }
}

fn content_digest(bytes: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    digest[..12].to_string()
}

fn decode_data_url(url: &str) -> Result<(Vec<u8>, Option<String>)> {
    let Some(rest) = url.strip_prefix("data:") else {
        bail!("not a data URL");
    };
    let Some((meta, payload)) = rest.split_once(',') else {
        bail!("data URL has no payload");
    };
    let mime = meta
        .split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    if !meta.ends_with(";base64") {
        bail!("only base64 data URLs are supported");
    }
    let bytes = BASE64
        .decode(payload.trim())
        .context("data URL payload is not valid base64")?;
    Ok((bytes, mime))
}

fn asset_extension(asset: &AssetRef, mime_type: Option<&str>) -> String {
    let from_path = match asset {
        AssetRef::Local(path) => path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase),
        AssetRef::Remote(url) => Url::parse(url).ok().and_then(|parsed| {
            Path::new(parsed.path())
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase)
        }),
        AssetRef::Inline(_) => None,
    };
    if let Some(ext) = from_path.filter(|ext| !ext.is_empty() && ext.len() <= 5) {
        return ext;
    }
    let mime = mime_type
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match mime.as_str() {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "model/gltf+json" => "gltf",
        "model/obj" => "obj",
        _ => "glb",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use plan3d_contracts::assets::data_url;

    use super::*;

    #[test]
    fn proxy_wraps_remote_urls_only() {
        assert_eq!(
            proxied_url(Some("https://app.local/api/"), "https://cdn.x/a b.glb?sig=1&t=2"),
            "https://app.local/api/proxy?url=https%3A%2F%2Fcdn.x%2Fa+b.glb%3Fsig%3D1%26t%3D2"
        );
        assert_eq!(proxied_url(None, "https://cdn.x/a.glb"), "https://cdn.x/a.glb");
        assert_eq!(
            proxied_url(Some("https://app.local"), "data:image/png;base64,AA"),
            "data:image/png;base64,AA"
        );
    }

    #[test]
    fn inline_asset_downloads_with_content_name() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let fetcher = AssetFetcher::new(None);
        let asset = AssetRef::Inline(data_url("image/png", b"pixels"));

        let path = fetcher.download(&asset, temp.path())?;

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        assert!(name.starts_with("mesh-"));
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), "mesh-".len() + 12 + ".png".len());
        assert_eq!(fs::read(&path)?, b"pixels");

        let again = fetcher.download(&asset, temp.path())?;
        assert_eq!(again, path);
        Ok(())
    }

    #[test]
    fn extension_prefers_url_path_then_mime() {
        assert_eq!(
            asset_extension(&AssetRef::remote("https://x/t/model.GLB?sig=abc"), None),
            "glb"
        );
        assert_eq!(
            asset_extension(&AssetRef::remote("https://x/t/download"), Some("image/jpeg")),
            "jpg"
        );
        assert_eq!(asset_extension(&AssetRef::remote("https://x/t/raw"), None), "glb");
    }

    #[test]
    fn malformed_data_url_is_rejected() {
        assert!(decode_data_url("data:image/png,raw").is_err());
        assert!(decode_data_url("data:image/png;base64").is_err());
    }
}
