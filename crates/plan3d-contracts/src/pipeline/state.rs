use indexmap::IndexMap;

use crate::assets::AssetRef;
use crate::errors::{ActionRejected, IgnoreReason, UpdateIgnored};
use crate::jobs::JobId;

use super::item::{
    ArtifactKind, GenerationOptions, ImageItem, ItemId, PipelineAction, PipelineStage,
    StylizeOptions,
};
use super::policy::PreprocessStep;

/// Which item, epoch and stage an outstanding call was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub item_id: ItemId,
    pub epoch: u64,
    pub stage: PipelineStage,
    pub action: PipelineAction,
}

/// Result of an outstanding call, applied only while its ticket is current.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineUpdate {
    Advance(PipelineStage),
    Uploaded(AssetRef),
    StepOutput { step: PreprocessStep, asset: AssetRef },
    StepReused(PreprocessStep),
    StepSkipped { step: PreprocessStep, reason: String },
    JobSubmitted(JobId),
    JobProgress { percent: u8, status: String },
    MeshReady { mesh: AssetRef, thumbnail: Option<String> },
    Enhanced(AssetRef),
    Screenshot(AssetRef),
    Stylized(AssetRef),
    Failed { message: String },
    Log(String),
}

/// All live items. Every mutation goes through this type.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    items: IndexMap<ItemId, ImageItem>,
    revision: u64,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every applied mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: &ItemId) -> Option<&ImageItem> {
        self.items.get(id)
    }

    pub fn items(&self) -> impl Iterator<Item = &ImageItem> {
        self.items.values()
    }

    pub fn active(&self) -> Option<&ImageItem> {
        self.items.values().last()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drops every current item and installs `item`. Returns the removed ids.
    pub fn replace_with(&mut self, item: ImageItem) -> Vec<ItemId> {
        let removed = self.clear();
        self.items.insert(item.id.clone(), item);
        self.revision += 1;
        removed
    }

    pub fn clear(&mut self) -> Vec<ItemId> {
        let removed: Vec<ItemId> = self.items.keys().cloned().collect();
        if !removed.is_empty() {
            self.items.clear();
            self.revision += 1;
        }
        removed
    }

    pub fn remove(&mut self, id: &ItemId) -> Option<ImageItem> {
        let removed = self.items.shift_remove(id)?;
        self.revision += 1;
        Some(removed)
    }

    pub fn set_generation_options(
        &mut self,
        id: &ItemId,
        options: GenerationOptions,
    ) -> Result<(), ActionRejected> {
        let item = self.item_mut(id)?;
        item.generation = options;
        self.revision += 1;
        Ok(())
    }

    pub fn set_stylize_options(
        &mut self,
        id: &ItemId,
        options: StylizeOptions,
    ) -> Result<(), ActionRejected> {
        let item = self.item_mut(id)?;
        item.stylize = options;
        self.revision += 1;
        Ok(())
    }

    /// Checks preconditions for `action`, moves the item to the action's first
    /// stage and issues the ticket later results must present.
    pub fn begin(&mut self, id: &ItemId, action: PipelineAction) -> Result<Ticket, ActionRejected> {
        let item = self.item_mut(id)?;
        if item.stage.is_busy() {
            return Err(ActionRejected::Busy {
                item: id.clone(),
                stage: item.stage,
            });
        }

        if matches!(action, PipelineAction::Enhance | PipelineAction::Generate)
            && item.input_image().is_none()
        {
            return Err(ActionRejected::MissingSource { action });
        }

        let stage = match action {
            PipelineAction::Enhance => {
                if !matches!(item.stage, PipelineStage::Idle | PipelineStage::Error)
                    || item.artifacts.contains(ArtifactKind::Mesh)
                {
                    return Err(ActionRejected::InvalidStage {
                        action,
                        stage: item.stage,
                    });
                }
                PipelineStage::Enhancing
            }
            PipelineAction::Generate => PipelineStage::Uploading,
            PipelineAction::Capture | PipelineAction::Stylize => {
                if !matches!(item.stage, PipelineStage::Captured | PipelineStage::Complete) {
                    return Err(ActionRejected::InvalidStage {
                        action,
                        stage: item.stage,
                    });
                }
                if !item.artifacts.contains(ArtifactKind::Mesh) {
                    return Err(ActionRejected::MissingArtifact {
                        action,
                        missing: ArtifactKind::Mesh,
                    });
                }
                if action == PipelineAction::Stylize {
                    if !item.artifacts.contains(ArtifactKind::Screenshot) {
                        return Err(ActionRejected::MissingArtifact {
                            action,
                            missing: ArtifactKind::Screenshot,
                        });
                    }
                    PipelineStage::Stylizing
                } else {
                    item.stage
                }
            }
        };

        if action == PipelineAction::Generate {
            let cleared = item.artifacts.invalidate_from(ArtifactKind::Mesh);
            if !cleared.is_empty() {
                let names: Vec<&str> = cleared.iter().map(|kind| kind.as_str()).collect();
                item.push_log(format!("Cleared stale {}", names.join(", ")));
            }
        }

        item.epoch += 1;
        item.stage = stage;
        item.job_id = None;
        item.progress = None;
        if action != PipelineAction::Capture {
            item.failed_action = None;
            item.push_log(format!("Starting {action}"));
        }
        let ticket = Ticket {
            item_id: id.clone(),
            epoch: item.epoch,
            stage,
            action,
        };
        self.revision += 1;
        Ok(ticket)
    }

    /// Moves a failed item back to the last stable stage and hands back the
    /// action to run again. Upstream artifacts are kept.
    pub fn reset_for_retry(&mut self, id: &ItemId) -> Result<PipelineAction, ActionRejected> {
        let item = self.item_mut(id)?;
        if item.stage != PipelineStage::Error {
            return Err(ActionRejected::NothingToRetry(id.clone()));
        }
        let Some(action) = item.failed_action.take() else {
            return Err(ActionRejected::NothingToRetry(id.clone()));
        };
        item.stage = if item.artifacts.contains(ArtifactKind::Mesh) {
            PipelineStage::Captured
        } else {
            PipelineStage::Idle
        };
        item.epoch += 1;
        item.push_log(format!("Retrying {action}"));
        self.revision += 1;
        Ok(action)
    }

    /// The single entry point for asynchronous results.
    pub fn apply(
        &mut self,
        ticket: &Ticket,
        update: PipelineUpdate,
    ) -> Result<Ticket, UpdateIgnored> {
        let ignored = |reason| UpdateIgnored {
            item_id: ticket.item_id.clone(),
            reason,
        };
        let Some(item) = self.items.get_mut(&ticket.item_id) else {
            return Err(ignored(IgnoreReason::ItemRemoved));
        };
        if item.epoch != ticket.epoch {
            return Err(ignored(IgnoreReason::Superseded));
        }
        if item.stage != ticket.stage {
            return Err(ignored(IgnoreReason::StageMoved));
        }
        if !update_applies(item, ticket, &update) {
            return Err(ignored(IgnoreReason::NotApplicable));
        }

        match update {
            PipelineUpdate::Advance(next) => {
                item.stage = next;
                item.push_log(format!("Stage: {next}"));
            }
            PipelineUpdate::Uploaded(asset) => {
                item.push_log(format!("Uploaded {}", asset.label()));
                item.uploaded = Some(asset);
            }
            PipelineUpdate::StepOutput { step, asset } => {
                item.push_log(format!("{step} produced {}", step.artifact()));
                item.artifacts.set(step.artifact(), asset);
            }
            PipelineUpdate::StepReused(step) => {
                item.push_log(format!("Reusing existing {}", step.artifact()));
            }
            PipelineUpdate::StepSkipped { step, reason } => {
                item.push_log(format!("Skipped {step}: {reason}"));
            }
            PipelineUpdate::JobSubmitted(job_id) => {
                item.push_log(format!("Submitted mesh job {job_id}"));
                item.job_id = Some(job_id);
                item.progress = Some(0);
            }
            PipelineUpdate::JobProgress { percent, status } => {
                if item.progress != Some(percent) {
                    item.push_log(format!("Modeling: {percent}% ({status})"));
                }
                item.progress = Some(percent);
            }
            PipelineUpdate::MeshReady { mesh, thumbnail } => {
                item.job_id = None;
                item.progress = None;
                item.push_log(format!("Mesh ready: {}", mesh.label()));
                if let Some(thumbnail) = thumbnail {
                    item.push_log(format!("Preview: {thumbnail}"));
                }
                item.artifacts.set(ArtifactKind::Mesh, mesh);
                item.stage = PipelineStage::Captured;
            }
            PipelineUpdate::Enhanced(asset) => {
                item.push_log(format!("Enhanced image ready: {}", asset.label()));
                item.artifacts.set(ArtifactKind::EnhancedImage, asset);
                item.stage = PipelineStage::Idle;
            }
            PipelineUpdate::Screenshot(asset) => {
                let cleared = item.artifacts.set(ArtifactKind::Screenshot, asset);
                if cleared.contains(&ArtifactKind::StylizedImage) {
                    item.push_log("Captured new view; previous render discarded");
                } else {
                    item.push_log("Captured current view");
                }
                item.stage = PipelineStage::Captured;
            }
            PipelineUpdate::Stylized(asset) => {
                item.push_log(format!("Render ready: {}", asset.label()));
                item.artifacts.set(ArtifactKind::StylizedImage, asset);
                item.stage = PipelineStage::Complete;
            }
            PipelineUpdate::Failed { message } => {
                item.job_id = None;
                item.progress = None;
                item.failed_action = Some(ticket.action);
                item.stage = PipelineStage::Error;
                item.push_log(format!("Error: {message}"));
            }
            PipelineUpdate::Log(message) => item.push_log(message),
        }

        let next = Ticket {
            stage: item.stage,
            ..ticket.clone()
        };
        self.revision += 1;
        Ok(next)
    }

    /// Structural invariants; used by tests and debug assertions.
    pub fn check_invariants(&self) -> Result<(), String> {
        for item in self.items.values() {
            let has_mesh = item.artifacts.contains(ArtifactKind::Mesh);
            if item.stage != PipelineStage::Error && has_mesh != item.stage.holds_mesh() {
                return Err(format!(
                    "item {} in stage {} has mesh={has_mesh}",
                    item.id, item.stage
                ));
            }
            if item.job_id.is_some() && item.stage != PipelineStage::Modeling {
                return Err(format!(
                    "item {} holds job id outside modeling ({})",
                    item.id, item.stage
                ));
            }
        }
        Ok(())
    }

    fn item_mut(&mut self, id: &ItemId) -> Result<&mut ImageItem, ActionRejected> {
        self.items
            .get_mut(id)
            .ok_or_else(|| ActionRejected::UnknownItem(id.clone()))
    }
}

fn stage_rank(stage: PipelineStage) -> Option<u8> {
    match stage {
        PipelineStage::Uploading => Some(0),
        PipelineStage::Masking => Some(1),
        PipelineStage::DepthEstimating => Some(2),
        PipelineStage::Modeling => Some(3),
        _ => None,
    }
}

fn update_applies(item: &ImageItem, ticket: &Ticket, update: &PipelineUpdate) -> bool {
    let stage = ticket.stage;
    let generating = ticket.action == PipelineAction::Generate;
    match update {
        PipelineUpdate::Advance(next) => {
            generating
                && matches!(
                    (stage_rank(stage), stage_rank(*next)),
                    (Some(from), Some(to)) if to > from
                )
        }
        PipelineUpdate::Uploaded(_) => stage == PipelineStage::Uploading,
        PipelineUpdate::StepOutput { step, .. } | PipelineUpdate::StepSkipped { step, .. } => {
            generating && stage == step.stage()
        }
        PipelineUpdate::StepReused(_) => generating && stage_rank(stage).is_some(),
        PipelineUpdate::JobSubmitted(_) => {
            stage == PipelineStage::Modeling && item.job_id.is_none()
        }
        PipelineUpdate::JobProgress { .. } => {
            stage == PipelineStage::Modeling && item.job_id.is_some()
        }
        PipelineUpdate::MeshReady { .. } => stage == PipelineStage::Modeling,
        PipelineUpdate::Enhanced(_) => stage == PipelineStage::Enhancing,
        PipelineUpdate::Screenshot(_) => {
            ticket.action == PipelineAction::Capture
                && matches!(stage, PipelineStage::Captured | PipelineStage::Complete)
        }
        PipelineUpdate::Stylized(_) => stage == PipelineStage::Stylizing,
        PipelineUpdate::Failed { .. } => stage.is_busy(),
        PipelineUpdate::Log(_) => true,
    }
}
