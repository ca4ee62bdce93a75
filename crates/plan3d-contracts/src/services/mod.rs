pub mod endpoints;
pub mod extract;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::assets::AssetRef;
use crate::jobs::JobId;
use crate::pipeline::{GenerationOptions, StylizeOptions};

pub use endpoints::{EndpointRegistry, EndpointSpec, Vendor};

/// Remote inference services the pipeline is allowed to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Segmentation,
    Depth,
    MeshGeneration,
    ImageToImage,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [
        Self::Segmentation,
        Self::Depth,
        Self::MeshGeneration,
        Self::ImageToImage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::Depth => "depth",
            Self::MeshGeneration => "mesh-generation",
            Self::ImageToImage => "image-to-image",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Service '{}' is not on the allow-list.", raw.trim()))
    }
}

/// Typed request for one adapter invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceCall {
    Segment {
        image: AssetRef,
    },
    EstimateDepth {
        image: AssetRef,
    },
    GenerateMesh {
        image: AssetRef,
        options: GenerationOptions,
    },
    ImageToImage {
        image: AssetRef,
        options: StylizeOptions,
    },
}

impl ServiceCall {
    pub fn service(&self) -> ServiceKind {
        match self {
            Self::Segment { .. } => ServiceKind::Segmentation,
            Self::EstimateDepth { .. } => ServiceKind::Depth,
            Self::GenerateMesh { .. } => ServiceKind::MeshGeneration,
            Self::ImageToImage { .. } => ServiceKind::ImageToImage,
        }
    }

    pub fn image(&self) -> &AssetRef {
        match self {
            Self::Segment { image }
            | Self::EstimateDepth { image }
            | Self::GenerateMesh { image, .. }
            | Self::ImageToImage { image, .. } => image,
        }
    }
}

/// Canonical result of an invocation: either the asset itself or a job to poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutput {
    Asset(AssetRef),
    Job(JobId),
}
