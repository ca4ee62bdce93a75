use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::assets::AssetRef;
use crate::jobs::JobId;

pub const DEFAULT_TARGET_POLYCOUNT: u32 = 30_000;
pub const DEFAULT_TEXTURE_RESOLUTION: u32 = 2048;
pub const DEFAULT_STYLIZE_PROMPT: &str =
    "photorealistic architectural interior render, soft natural daylight, realistic materials";
pub const DEFAULT_ENHANCE_PROMPT: &str =
    "clean high-contrast architectural floorplan, crisp black walls, white background";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStage {
    Idle,
    Uploading,
    Enhancing,
    Masking,
    DepthEstimating,
    Modeling,
    Captured,
    Stylizing,
    Complete,
    Error,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Uploading => "uploading",
            Self::Enhancing => "enhancing",
            Self::Masking => "masking",
            Self::DepthEstimating => "depth-estimating",
            Self::Modeling => "modeling",
            Self::Captured => "captured",
            Self::Stylizing => "stylizing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// A call is outstanding while the item sits in one of these stages.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Uploading
                | Self::Enhancing
                | Self::Masking
                | Self::DepthEstimating
                | Self::Modeling
                | Self::Stylizing
        )
    }

    pub fn holds_mesh(self) -> bool {
        matches!(self, Self::Captured | Self::Stylizing | Self::Complete)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    EnhancedImage,
    Mask,
    DepthMap,
    Mesh,
    Screenshot,
    StylizedImage,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EnhancedImage => "enhanced-image",
            Self::Mask => "mask",
            Self::DepthMap => "depth-map",
            Self::Mesh => "mesh",
            Self::Screenshot => "screenshot",
            Self::StylizedImage => "stylized-image",
        }
    }

    /// Artifacts computed from this one; they go stale when it changes.
    pub fn downstream(self) -> &'static [ArtifactKind] {
        match self {
            Self::EnhancedImage => &[
                Self::Mask,
                Self::DepthMap,
                Self::Mesh,
                Self::Screenshot,
                Self::StylizedImage,
            ],
            Self::Mask => &[
                Self::DepthMap,
                Self::Mesh,
                Self::Screenshot,
                Self::StylizedImage,
            ],
            Self::DepthMap => &[Self::Mesh, Self::Screenshot, Self::StylizedImage],
            Self::Mesh => &[Self::Screenshot, Self::StylizedImage],
            Self::Screenshot => &[Self::StylizedImage],
            Self::StylizedImage => &[],
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifacts(BTreeMap<ArtifactKind, AssetRef>);

impl Artifacts {
    pub fn get(&self, kind: ArtifactKind) -> Option<&AssetRef> {
        self.0.get(&kind)
    }

    pub fn contains(&self, kind: ArtifactKind) -> bool {
        self.0.contains_key(&kind)
    }

    /// Stores `asset` and drops everything downstream of `kind`. Returns the dropped kinds.
    pub fn set(&mut self, kind: ArtifactKind, asset: AssetRef) -> Vec<ArtifactKind> {
        let cleared = self.clear_downstream(kind);
        self.0.insert(kind, asset);
        cleared
    }

    /// Removes `kind` itself and everything downstream of it.
    pub fn invalidate_from(&mut self, kind: ArtifactKind) -> Vec<ArtifactKind> {
        let mut cleared = Vec::new();
        if self.0.remove(&kind).is_some() {
            cleared.push(kind);
        }
        cleared.extend(self.clear_downstream(kind));
        cleared
    }

    pub fn iter(&self) -> impl Iterator<Item = (ArtifactKind, &AssetRef)> {
        self.0.iter().map(|(kind, asset)| (*kind, asset))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn clear_downstream(&mut self, kind: ArtifactKind) -> Vec<ArtifactKind> {
        kind.downstream()
            .iter()
            .copied()
            .filter(|downstream| self.0.remove(downstream).is_some())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineAction {
    Enhance,
    Generate,
    Capture,
    Stylize,
}

impl PipelineAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enhance => "enhance",
            Self::Generate => "generate",
            Self::Capture => "capture",
            Self::Stylize => "stylize",
        }
    }
}

impl fmt::Display for PipelineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymmetryMode {
    Off,
    #[default]
    Auto,
    On,
}

impl SymmetryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Auto => "auto",
            Self::On => "on",
        }
    }
}

impl FromStr for SymmetryMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "auto" => Ok(Self::Auto),
            "on" => Ok(Self::On),
            other => Err(format!("unknown symmetry mode '{other}' (off|auto|on)")),
        }
    }
}

/// Parameters for the next mesh-generation submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub prompt: Option<String>,
    pub texture_prompt: Option<String>,
    pub target_polycount: u32,
    pub symmetry_mode: SymmetryMode,
    pub texture_resolution: u32,
    pub enable_pbr: bool,
    pub skip_enhancement: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            prompt: None,
            texture_prompt: None,
            target_polycount: DEFAULT_TARGET_POLYCOUNT,
            symmetry_mode: SymmetryMode::Auto,
            texture_resolution: DEFAULT_TEXTURE_RESOLUTION,
            enable_pbr: true,
            skip_enhancement: false,
        }
    }
}

impl GenerationOptions {
    /// Applies one `key=value` setting from the command line.
    pub fn apply_setting(&mut self, key: &str, value: &Value) -> Result<(), String> {
        match key.trim().to_ascii_lowercase().as_str() {
            "prompt" => self.prompt = value_as_text(value),
            "texture_prompt" => self.texture_prompt = value_as_text(value),
            "target_polycount" | "polycount" => {
                let count = value_as_u64(value)
                    .ok_or_else(|| format!("target_polycount expects a number, got {value}"))?;
                self.target_polycount = saturating_u32(count).clamp(100, 300_000);
            }
            "symmetry_mode" | "symmetry" => {
                let raw = value_as_text(value).unwrap_or_default();
                self.symmetry_mode = raw.parse()?;
            }
            "texture_resolution" => {
                let raw = value_as_u64(value)
                    .ok_or_else(|| format!("texture_resolution expects a number, got {value}"))?;
                self.texture_resolution = snap_texture_resolution(saturating_u32(raw));
            }
            "enable_pbr" | "pbr" => {
                self.enable_pbr = value_as_bool(value)
                    .ok_or_else(|| format!("enable_pbr expects true/false, got {value}"))?;
            }
            "skip_enhancement" => {
                self.skip_enhancement = value_as_bool(value)
                    .ok_or_else(|| format!("skip_enhancement expects true/false, got {value}"))?;
            }
            other => return Err(format!("unknown generation option '{other}'")),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StylizeOptions {
    pub prompt: String,
    pub strength: f64,
    pub guidance_scale: f64,
    pub inference_steps: u32,
}

impl Default for StylizeOptions {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_STYLIZE_PROMPT.to_string(),
            strength: 0.75,
            guidance_scale: 7.5,
            inference_steps: 28,
        }
    }
}

impl StylizeOptions {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn clamped(&self) -> Self {
        Self {
            prompt: self.prompt.trim().to_string(),
            strength: self.strength.clamp(0.0, 1.0),
            guidance_scale: self.guidance_scale.clamp(0.0, 30.0),
            inference_steps: self.inference_steps.clamp(1, 100),
        }
    }

    pub fn apply_setting(&mut self, key: &str, value: &Value) -> Result<(), String> {
        match key.trim().to_ascii_lowercase().as_str() {
            "style_prompt" => self.prompt = value_as_text(value).unwrap_or_default(),
            "strength" => {
                self.strength = value_as_f64(value)
                    .ok_or_else(|| format!("strength expects a number, got {value}"))?;
            }
            "guidance_scale" | "guidance" => {
                self.guidance_scale = value_as_f64(value)
                    .ok_or_else(|| format!("guidance_scale expects a number, got {value}"))?;
            }
            "inference_steps" | "steps" => {
                let steps = value_as_u64(value)
                    .ok_or_else(|| format!("inference_steps expects a number, got {value}"))?;
                self.inference_steps = saturating_u32(steps);
            }
            other => return Err(format!("unknown stylize option '{other}'")),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemOrigin {
    Upload,
    History { task_id: String },
}

/// One uploaded or history-loaded floorplan and everything derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageItem {
    pub id: ItemId,
    pub source: Option<AssetRef>,
    pub uploaded: Option<AssetRef>,
    pub stage: PipelineStage,
    pub artifacts: Artifacts,
    pub job_id: Option<JobId>,
    pub progress: Option<u8>,
    pub log: Vec<String>,
    pub generation: GenerationOptions,
    pub stylize: StylizeOptions,
    pub origin: ItemOrigin,
    pub epoch: u64,
    pub failed_action: Option<PipelineAction>,
}

impl ImageItem {
    pub fn new(source: AssetRef) -> Self {
        Self::with_source(Some(source))
    }

    /// History jobs may not report the image they were made from.
    pub(crate) fn with_source(source: Option<AssetRef>) -> Self {
        Self {
            id: ItemId::new(),
            source,
            uploaded: None,
            stage: PipelineStage::Idle,
            artifacts: Artifacts::default(),
            job_id: None,
            progress: None,
            log: Vec::new(),
            generation: GenerationOptions::default(),
            stylize: StylizeOptions::default(),
            origin: ItemOrigin::Upload,
            epoch: 0,
            failed_action: None,
        }
    }

    /// The image a run starts from: the hosted copy when there is one.
    pub fn input_image(&self) -> Option<&AssetRef> {
        self.uploaded.as_ref().or(self.source.as_ref())
    }

    pub fn artifact(&self, kind: ArtifactKind) -> Option<&AssetRef> {
        self.artifacts.get(kind)
    }

    pub fn push_log(&mut self, message: impl Into<String>) {
        let message = message.into();
        if message.trim().is_empty() {
            return;
        }
        self.log.push(message);
    }

    pub fn last_log(&self) -> Option<&str> {
        self.log.last().map(String::as_str)
    }
}

/// Meshy accepts 1024, 2048 or 4096; anything else snaps to the nearest.
pub fn snap_texture_resolution(raw: u32) -> u32 {
    [1024u32, 2048, 4096]
        .into_iter()
        .min_by_key(|candidate| candidate.abs_diff(raw))
        .unwrap_or(DEFAULT_TEXTURE_RESOLUTION)
}

fn saturating_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.trim().to_string()).filter(|text| !text.is_empty()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v.round() as u64)),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        },
        Value::Number(number) => number.as_i64().map(|value| value != 0),
        _ => None,
    }
}
