use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use plan3d_contracts::pipeline::PipelineLayout;
use plan3d_contracts::services::{EndpointRegistry, EndpointSpec, Vendor};
use serde::{Deserialize, Serialize};

use crate::poller::PollPolicy;

pub const DEFAULT_FAL_API_BASE: &str = "https://fal.run";
pub const DEFAULT_MESHY_API_BASE: &str = "https://api.meshy.ai";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_POLL_TIMEOUT_S: u64 = 600;

/// Everything the engine needs from the outside world, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub fal_api_base: String,
    pub fal_key: Option<String>,
    pub meshy_api_base: String,
    pub meshy_key: Option<String>,
    pub proxy_base: Option<String>,
    pub poll_interval_ms: u64,
    pub poll_timeout_s: u64,
    pub poll_max_attempts: Option<u32>,
    pub layout: PipelineLayout,
    /// Replaces the default endpoint of each listed service.
    pub endpoints: Vec<EndpointSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fal_api_base: DEFAULT_FAL_API_BASE.to_string(),
            fal_key: None,
            meshy_api_base: DEFAULT_MESHY_API_BASE.to_string(),
            meshy_key: None,
            proxy_base: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_timeout_s: DEFAULT_POLL_TIMEOUT_S,
            poll_max_attempts: None,
            layout: PipelineLayout::default(),
            endpoints: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Optional JSON file first, then the process environment on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.overlay(non_empty_env)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON in {}", path.display()))?;
        Ok(config)
    }

    /// Applies environment overrides read through `lookup`.
    pub fn overlay(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(key) = lookup("FAL_KEY").or_else(|| lookup("FAL_API_KEY")) {
            self.fal_key = Some(key);
        }
        if let Some(base) = lookup("FAL_API_BASE") {
            self.fal_api_base = base;
        }
        if let Some(key) = lookup("MESHY_API_KEY") {
            self.meshy_key = Some(key);
        }
        if let Some(base) = lookup("MESHY_API_BASE") {
            self.meshy_api_base = base;
        }
        if let Some(proxy) = lookup("PLAN3D_PROXY_BASE") {
            self.proxy_base = Some(proxy);
        }
        if let Some(raw) = lookup("PLAN3D_POLL_INTERVAL_MS") {
            self.poll_interval_ms = raw
                .parse()
                .with_context(|| format!("PLAN3D_POLL_INTERVAL_MS is not a number: {raw}"))?;
        }
        if let Some(raw) = lookup("PLAN3D_POLL_TIMEOUT_S") {
            self.poll_timeout_s = raw
                .parse()
                .with_context(|| format!("PLAN3D_POLL_TIMEOUT_S is not a number: {raw}"))?;
        }
        if let Some(raw) = lookup("PLAN3D_LAYOUT") {
            self.set_layout_preset(&raw)?;
        }
        self.normalize();
        Ok(())
    }

    pub fn set_layout_preset(&mut self, name: &str) -> Result<()> {
        let Some(layout) = PipelineLayout::preset(name) else {
            bail!("unknown pipeline layout '{name}' (expected depth or segmented)");
        };
        self.layout = layout;
        Ok(())
    }

    pub fn api_base(&self, vendor: Vendor) -> &str {
        match vendor {
            Vendor::Fal => &self.fal_api_base,
            Vendor::Meshy => &self.meshy_api_base,
        }
    }

    pub fn api_key(&self, vendor: Vendor) -> Option<&str> {
        match vendor {
            Vendor::Fal => self.fal_key.as_deref(),
            Vendor::Meshy => self.meshy_key.as_deref(),
        }
    }

    /// A base URL other than the vendor's own is assumed to inject credentials.
    pub fn uses_proxy_for(&self, vendor: Vendor) -> bool {
        let default = match vendor {
            Vendor::Fal => DEFAULT_FAL_API_BASE,
            Vendor::Meshy => DEFAULT_MESHY_API_BASE,
        };
        self.api_base(vendor) != default
    }

    pub fn endpoint_registry(&self) -> EndpointRegistry {
        let mut registry = EndpointRegistry::default();
        for spec in &self.endpoints {
            registry.override_with(EndpointSpec::new(spec.service, spec.vendor, &spec.path));
        }
        registry
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.poll_max_attempts,
            max_duration: (self.poll_timeout_s > 0)
                .then(|| Duration::from_secs(self.poll_timeout_s)),
        }
    }

    fn normalize(&mut self) {
        self.fal_api_base = trim_base(&self.fal_api_base, DEFAULT_FAL_API_BASE);
        self.meshy_api_base = trim_base(&self.meshy_api_base, DEFAULT_MESHY_API_BASE);
        self.proxy_base = self
            .proxy_base
            .as_deref()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());
        self.fal_key = non_empty(self.fal_key.take());
        self.meshy_key = non_empty(self.meshy_key.take());
    }
}

fn trim_base(raw: &str, default: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use plan3d_contracts::pipeline::PreprocessStep;
    use plan3d_contracts::services::ServiceKind;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn environment_overrides_defaults() -> Result<()> {
        let mut config = EngineConfig::default();
        config.overlay(lookup_from(&[
            ("FAL_API_KEY", "fal-secret"),
            ("MESHY_API_BASE", "https://proxy.local/meshy/"),
            ("PLAN3D_PROXY_BASE", "https://proxy.local/"),
            ("PLAN3D_POLL_INTERVAL_MS", "500"),
            ("PLAN3D_LAYOUT", "segmented"),
        ]))?;

        assert_eq!(config.api_key(Vendor::Fal), Some("fal-secret"));
        assert_eq!(config.api_base(Vendor::Meshy), "https://proxy.local/meshy");
        assert!(config.uses_proxy_for(Vendor::Meshy));
        assert!(!config.uses_proxy_for(Vendor::Fal));
        assert_eq!(config.proxy_base.as_deref(), Some("https://proxy.local"));
        assert_eq!(config.poll_policy().interval, Duration::from_millis(500));
        assert_eq!(config.layout.steps[0].step, PreprocessStep::Segmentation);
        Ok(())
    }

    #[test]
    fn invalid_environment_values_are_reported() {
        let mut config = EngineConfig::default();
        let err = config
            .overlay(lookup_from(&[("PLAN3D_POLL_TIMEOUT_S", "soon")]))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.contains("PLAN3D_POLL_TIMEOUT_S"));

        let mut config = EngineConfig::default();
        assert!(config
            .overlay(lookup_from(&[("PLAN3D_LAYOUT", "voxels")]))
            .is_err());
    }

    #[test]
    fn config_file_overrides_endpoints() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("plan3d.json");
        fs::write(
            &path,
            r#"{
                "poll_timeout_s": 0,
                "endpoints": [
                    {"service": "mesh-generation", "vendor": "fal", "path": "fal-ai/trellis"}
                ]
            }"#,
        )?;

        let config = EngineConfig::from_file(&path)?;
        let registry = config.endpoint_registry();
        let mesh = registry.get(ServiceKind::MeshGeneration).cloned();

        assert_eq!(mesh.map(|spec| spec.vendor), Some(Vendor::Fal));
        assert_eq!(config.poll_policy().max_duration, None);
        assert_eq!(config.fal_api_base, DEFAULT_FAL_API_BASE);
        Ok(())
    }
}
