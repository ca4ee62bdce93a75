use std::fmt;

use serde::{Deserialize, Serialize};

use crate::assets::AssetRef;
use crate::services::ServiceKind;

use super::item::{ArtifactKind, ImageItem, PipelineStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreprocessStep {
    Segmentation,
    DepthEstimation,
}

impl PreprocessStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Segmentation => "segmentation",
            Self::DepthEstimation => "depth-estimation",
        }
    }

    fn order(self) -> u8 {
        match self {
            Self::Segmentation => 0,
            Self::DepthEstimation => 1,
        }
    }

    pub fn stage(self) -> PipelineStage {
        match self {
            Self::Segmentation => PipelineStage::Masking,
            Self::DepthEstimation => PipelineStage::DepthEstimating,
        }
    }

    pub fn artifact(self) -> ArtifactKind {
        match self {
            Self::Segmentation => ArtifactKind::Mask,
            Self::DepthEstimation => ArtifactKind::DepthMap,
        }
    }

    pub fn service(self) -> ServiceKind {
        match self {
            Self::Segmentation => ServiceKind::Segmentation,
            Self::DepthEstimation => ServiceKind::Depth,
        }
    }
}

impl fmt::Display for PreprocessStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failed preprocessing step does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPolicy {
    pub step: PreprocessStep,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

impl StepPolicy {
    pub fn abort(step: PreprocessStep) -> Self {
        Self {
            step,
            on_failure: FailurePolicy::Abort,
        }
    }

    pub fn skip(step: PreprocessStep) -> Self {
        Self {
            step,
            on_failure: FailurePolicy::Skip,
        }
    }
}

/// Ordered preprocessing steps that run before mesh generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineLayout {
    pub steps: Vec<StepPolicy>,
}

impl Default for PipelineLayout {
    fn default() -> Self {
        Self::depth()
    }
}

impl PipelineLayout {
    pub fn depth() -> Self {
        Self {
            steps: vec![StepPolicy::abort(PreprocessStep::DepthEstimation)],
        }
    }

    pub fn segmented() -> Self {
        Self {
            steps: vec![
                StepPolicy::abort(PreprocessStep::Segmentation),
                StepPolicy::abort(PreprocessStep::DepthEstimation),
            ],
        }
    }

    pub fn preset(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "depth" | "depth+mesh" => Some(Self::depth()),
            "segmented" | "segmentation+depth+mesh" => Some(Self::segmented()),
            _ => None,
        }
    }

    pub fn with_policy(mut self, step: PreprocessStep, on_failure: FailurePolicy) -> Self {
        for policy in &mut self.steps {
            if policy.step == step {
                policy.on_failure = on_failure;
            }
        }
        self
    }

    /// Steps in pipeline order with duplicates dropped; the first policy for a step wins.
    pub fn normalized(&self) -> Self {
        let mut steps: Vec<StepPolicy> = Vec::new();
        for policy in &self.steps {
            if !steps.iter().any(|existing| existing.step == policy.step) {
                steps.push(*policy);
            }
        }
        steps.sort_by_key(|policy| policy.step.order());
        Self { steps }
    }
}

/// Image the first preprocessing step starts from.
pub fn base_input(item: &ImageItem) -> Option<AssetRef> {
    if !item.generation.skip_enhancement {
        if let Some(enhanced) = item.artifact(ArtifactKind::EnhancedImage) {
            return Some(enhanced.clone());
        }
    }
    if let Some(uploaded) = item.uploaded.as_ref() {
        return Some(uploaded.clone());
    }
    item.source.clone().filter(AssetRef::is_transferable)
}

pub fn step_input(item: &ImageItem, step: PreprocessStep) -> Option<AssetRef> {
    match step {
        PreprocessStep::Segmentation => base_input(item),
        PreprocessStep::DepthEstimation => item
            .artifact(ArtifactKind::Mask)
            .cloned()
            .or_else(|| base_input(item)),
    }
}

/// Mesh generation consumes the most processed image available.
pub fn generation_input(item: &ImageItem) -> Option<AssetRef> {
    item.artifact(ArtifactKind::DepthMap)
        .or_else(|| item.artifact(ArtifactKind::Mask))
        .cloned()
        .or_else(|| base_input(item))
}
