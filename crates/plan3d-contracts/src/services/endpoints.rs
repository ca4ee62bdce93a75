use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::ServiceKind;

/// Wire dialect spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    /// Synchronous JSON POST that answers with the result.
    Fal,
    /// Submit returns `{result: taskId}`; status is polled separately.
    Meshy,
}

impl Vendor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fal => "fal",
            Self::Meshy => "meshy",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub service: ServiceKind,
    pub vendor: Vendor,
    pub path: String,
}

impl EndpointSpec {
    pub fn new(service: ServiceKind, vendor: Vendor, path: &str) -> Self {
        Self {
            service,
            vendor,
            path: path.trim().trim_matches('/').to_string(),
        }
    }

    /// Absolute URL for this endpoint; a full URL in `path` wins over `api_base`.
    pub fn url(&self, api_base: &str) -> String {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return self.path.clone();
        }
        format!("{}/{}", api_base.trim_end_matches('/'), self.path)
    }
}

#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    endpoints: IndexMap<ServiceKind, EndpointSpec>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl EndpointRegistry {
    pub fn new(endpoints: Option<IndexMap<ServiceKind, EndpointSpec>>) -> Self {
        Self {
            endpoints: endpoints.unwrap_or_else(default_endpoints),
        }
    }

    pub fn get(&self, service: ServiceKind) -> Option<&EndpointSpec> {
        self.endpoints.get(&service)
    }

    pub fn list(&self) -> impl Iterator<Item = &EndpointSpec> {
        self.endpoints.values()
    }

    /// Replaces the endpoint for `spec.service`, keeping registry order.
    pub fn override_with(&mut self, spec: EndpointSpec) {
        self.endpoints.insert(spec.service, spec);
    }
}

fn default_endpoints() -> IndexMap<ServiceKind, EndpointSpec> {
    let mut map = IndexMap::new();

    let mut insert = |service: ServiceKind, vendor: Vendor, path: &str| {
        map.insert(service, EndpointSpec::new(service, vendor, path));
    };

    insert(
        ServiceKind::Segmentation,
        Vendor::Fal,
        "fal-ai/imageutils/rembg",
    );
    insert(ServiceKind::Depth, Vendor::Fal, "fal-ai/imageutils/depth");
    insert(
        ServiceKind::MeshGeneration,
        Vendor::Meshy,
        "openapi/v1/image-to-3d",
    );
    insert(
        ServiceKind::ImageToImage,
        Vendor::Fal,
        "fal-ai/flux/dev/image-to-image",
    );

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_service_in_order() {
        let registry = EndpointRegistry::default();
        let services: Vec<ServiceKind> = registry.list().map(|spec| spec.service).collect();
        assert_eq!(services, ServiceKind::ALL.to_vec());
        assert_eq!(
            registry
                .get(ServiceKind::MeshGeneration)
                .map(|spec| spec.vendor),
            Some(Vendor::Meshy)
        );
        let fal = registry
            .list()
            .filter(|spec| spec.vendor == Vendor::Fal)
            .count();
        assert_eq!(fal, 3);
    }

    #[test]
    fn override_swaps_vendor_without_reordering() {
        let mut registry = EndpointRegistry::default();
        registry.override_with(EndpointSpec::new(
            ServiceKind::MeshGeneration,
            Vendor::Fal,
            "/fal-ai/trellis/",
        ));
        let spec = registry.get(ServiceKind::MeshGeneration).cloned();
        assert_eq!(
            spec,
            Some(EndpointSpec {
                service: ServiceKind::MeshGeneration,
                vendor: Vendor::Fal,
                path: "fal-ai/trellis".to_string(),
            })
        );
        let services: Vec<ServiceKind> = registry.list().map(|spec| spec.service).collect();
        assert_eq!(services, ServiceKind::ALL.to_vec());
    }

    #[test]
    fn url_joins_base_or_keeps_absolute_path() {
        let relative = EndpointSpec::new(ServiceKind::Depth, Vendor::Fal, "fal-ai/imageutils/depth");
        assert_eq!(
            relative.url("https://fal.run/"),
            "https://fal.run/fal-ai/imageutils/depth"
        );
        let absolute = EndpointSpec::new(
            ServiceKind::Depth,
            Vendor::Fal,
            "https://proxy.local/depth",
        );
        assert_eq!(absolute.url("https://fal.run"), "https://proxy.local/depth");
    }
}
