use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use plan3d_contracts::assets::AssetRef;
use plan3d_contracts::errors::{
    ActionRejected, CaptureUnavailable, IgnoreReason, PipelineError, ServiceError, UpdateIgnored,
};
use plan3d_contracts::events::EventWriter;
use plan3d_contracts::history::HistoryEntry;
use plan3d_contracts::pipeline::{
    generation_input, step_input, ArtifactKind, FailurePolicy, GenerationOptions, ImageItem,
    ItemId, PipelineAction, PipelineLayout, PipelineStage, PipelineState, PipelineUpdate,
    PreprocessStep, StylizeOptions, Ticket, DEFAULT_ENHANCE_PROMPT,
};
use plan3d_contracts::services::{ServiceCall, ServiceKind, ServiceOutput};
use serde_json::{json, Value};

use crate::adapter::{input_url, map_object, HttpServiceAdapter, ServiceAdapter};
use crate::capture::{capture_current_view, SceneRenderer};
use crate::config::EngineConfig;
use crate::history::HistorySource;
use crate::poller::{poll_until_terminal, CancelToken, JobStatusSource, PollPolicy};

/// Enhancement keeps the drawing's geometry; only line quality should change.
pub const ENHANCE_STRENGTH: f64 = 0.35;

const STYLIZE_OPTION_KEYS: &[&str] = &[
    "style_prompt",
    "strength",
    "guidance_scale",
    "guidance",
    "inference_steps",
    "steps",
];

/// How an action ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The item settled in this stage.
    Completed(PipelineStage),
    /// The item was removed or moved on while the call was outstanding.
    Ignored(IgnoreReason),
}

enum Halt {
    Ignored(IgnoreReason),
    Failed(Ticket, PipelineError),
}

impl From<UpdateIgnored> for Halt {
    fn from(ignored: UpdateIgnored) -> Self {
        Self::Ignored(ignored.reason)
    }
}

/// Drives items through the pipeline. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    state: Arc<Mutex<PipelineState>>,
    cancels: Arc<Mutex<HashMap<ItemId, CancelToken>>>,
    adapter: Arc<dyn ServiceAdapter>,
    jobs: Arc<dyn JobStatusSource>,
    history: Arc<dyn HistorySource>,
    layout: PipelineLayout,
    poll: PollPolicy,
    events: Option<EventWriter>,
}

impl Coordinator {
    pub fn new(
        adapter: Arc<dyn ServiceAdapter>,
        jobs: Arc<dyn JobStatusSource>,
        history: Arc<dyn HistorySource>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(PipelineState::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            adapter,
            jobs,
            history,
            layout: PipelineLayout::default(),
            poll: PollPolicy::default(),
            events: None,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let http = Arc::new(HttpServiceAdapter::new(config.clone()));
        Self::new(http.clone(), http.clone(), http)
            .with_layout(config.layout.clone())
            .with_poll_policy(config.poll_policy())
    }

    pub fn with_layout(mut self, layout: PipelineLayout) -> Self {
        self.layout = layout.normalized();
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    pub fn emit_event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(events) = self.events.as_ref() {
            events.emit(event_type, map_object(payload))?;
        }
        Ok(())
    }

    fn emit_item_event(&self, event_type: &str, id: &ItemId, payload: Value) -> Result<()> {
        if let Some(events) = self.events.as_ref() {
            events.emit_for_item(event_type, id, map_object(payload))?;
        }
        Ok(())
    }

    pub fn snapshot(&self, id: &ItemId) -> Option<ImageItem> {
        self.state().get(id).cloned()
    }

    pub fn items(&self) -> Vec<ImageItem> {
        self.state().items().cloned().collect()
    }

    pub fn active_id(&self) -> Option<ItemId> {
        self.state().active().map(|item| item.id.clone())
    }

    pub fn revision(&self) -> u64 {
        self.state().revision()
    }

    /// Replaces every current item with a fresh upload.
    pub fn upload(&self, source: AssetRef) -> Result<ItemId, PipelineError> {
        Ok(self.install(ImageItem::new(source))?)
    }

    /// Replaces every current item with a finished job from history.
    pub fn load_history(&self, entry: HistoryEntry) -> Result<ItemId, PipelineError> {
        let item = entry.into_item()?;
        Ok(self.install(item)?)
    }

    pub fn list_history(&self, page_size: usize) -> Result<Vec<HistoryEntry>, PipelineError> {
        let entries = self.history.list_recent(page_size)?;
        self.emit_event(
            "history_loaded",
            json!({ "count": entries.len(), "page_size": page_size }),
        )?;
        Ok(entries)
    }

    pub fn history_entry(&self, task_id: &str) -> Result<HistoryEntry, PipelineError> {
        Ok(self.history.job_detail(task_id)?)
    }

    /// Drops the item and stops any poll loop still working for it.
    pub fn remove(&self, id: &ItemId) -> Result<bool, PipelineError> {
        let removed = self.state().remove(id).is_some();
        self.cancel_items(std::slice::from_ref(id));
        if removed {
            self.emit_item_event("item_removed", id, json!({ "reason": "removed" }))?;
        }
        Ok(removed)
    }

    /// Applies `key=value` settings to the item's generation and stylize options.
    pub fn update_options(
        &self,
        id: &ItemId,
        settings: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        let item = self
            .snapshot(id)
            .ok_or_else(|| ActionRejected::UnknownItem(id.clone()))?;
        let mut generation = item.generation;
        let mut stylize = item.stylize;
        for (key, value) in settings {
            let applied = if STYLIZE_OPTION_KEYS.contains(&key.as_str()) {
                stylize.apply_setting(key, value)
            } else {
                generation.apply_setting(key, value)
            };
            applied.map_err(ActionRejected::InvalidOption)?;
        }
        let mut state = self.state();
        state.set_generation_options(id, generation)?;
        state.set_stylize_options(id, stylize)?;
        Ok(())
    }

    pub fn enhance(
        &self,
        id: &ItemId,
        prompt: Option<String>,
    ) -> Result<ActionOutcome, PipelineError> {
        let ticket = self.begin(id, PipelineAction::Enhance)?;
        let result = self.run_enhance(ticket, prompt);
        self.finish(result)
    }

    /// Runs upload, the preprocessing layout and mesh generation. Steps whose
    /// artifact is still present are reused without a vendor call.
    pub fn generate(
        &self,
        id: &ItemId,
        prompt: Option<String>,
    ) -> Result<ActionOutcome, PipelineError> {
        let ticket = self.begin(id, PipelineAction::Generate)?;
        let cancel = self.register_cancel(id);
        let result = self
            .persist_options(id, |generation, _| {
                if let Some(prompt) = non_empty(prompt) {
                    generation.texture_prompt = Some(prompt);
                }
            })
            .and_then(|()| self.run_generate(ticket, &cancel));
        self.release_cancel(id, &cancel);
        self.finish(result)
    }

    pub fn capture_view(
        &self,
        id: &ItemId,
        renderer: Option<&mut dyn SceneRenderer>,
    ) -> Result<ActionOutcome, PipelineError> {
        let ticket = self.begin(id, PipelineAction::Capture)?;
        let Some(still) = capture_current_view(renderer) else {
            let logged = self.state().apply(
                &ticket,
                PipelineUpdate::Log("View capture unavailable; nothing to stylize".to_string()),
            );
            return match logged {
                Ok(_) => Err(CaptureUnavailable.into()),
                Err(ignored) => Ok(ActionOutcome::Ignored(ignored.reason)),
            };
        };
        let result = self.dispatch(&ticket, PipelineUpdate::Screenshot(still.asset));
        self.finish(result)
    }

    pub fn stylize(
        &self,
        id: &ItemId,
        prompt: Option<String>,
    ) -> Result<ActionOutcome, PipelineError> {
        let ticket = self.begin(id, PipelineAction::Stylize)?;
        let result = self
            .persist_options(id, |_, stylize| {
                if let Some(prompt) = non_empty(prompt) {
                    stylize.prompt = prompt;
                }
            })
            .and_then(|()| self.run_stylize(ticket));
        self.finish(result)
    }

    /// Resets a failed item to its last stable stage and re-runs the failed action.
    pub fn retry(&self, id: &ItemId) -> Result<ActionOutcome, PipelineError> {
        let action = self.state().reset_for_retry(id)?;
        match action {
            PipelineAction::Enhance => self.enhance(id, None),
            PipelineAction::Generate => self.generate(id, None),
            PipelineAction::Stylize => self.stylize(id, None),
            PipelineAction::Capture => Err(ActionRejected::NothingToRetry(id.clone()).into()),
        }
    }

    fn run_enhance(&self, ticket: Ticket, prompt: Option<String>) -> Result<Ticket, Halt> {
        let item = self.item_for(&ticket)?;
        let Some(image) = item.input_image().cloned() else {
            return Err(Halt::Failed(
                ticket,
                missing_input(ServiceKind::ImageToImage).into(),
            ));
        };
        let options = StylizeOptions {
            prompt: non_empty(prompt).unwrap_or_else(|| DEFAULT_ENHANCE_PROMPT.to_string()),
            strength: ENHANCE_STRENGTH,
            ..StylizeOptions::default()
        };
        match self.invoke_asset(&ServiceCall::ImageToImage { image, options }) {
            Ok(asset) => self.dispatch(&ticket, PipelineUpdate::Enhanced(asset)),
            Err(err) => Err(Halt::Failed(ticket, err.into())),
        }
    }

    fn run_generate(&self, ticket: Ticket, cancel: &CancelToken) -> Result<Ticket, Halt> {
        let mut ticket = ticket;
        let item = self.item_for(&ticket)?;
        let first_service = self
            .layout
            .steps
            .first()
            .map(|policy| policy.step.service())
            .unwrap_or(ServiceKind::MeshGeneration);
        ticket = match (item.uploaded.as_ref(), item.source.as_ref()) {
            (Some(_), _) => self.dispatch(
                &ticket,
                PipelineUpdate::Log("Reusing uploaded source".to_string()),
            )?,
            (None, Some(source)) => match upload_source(first_service, source) {
                Ok(uploaded) => self.dispatch(&ticket, PipelineUpdate::Uploaded(uploaded))?,
                Err(err) => return Err(Halt::Failed(ticket, err.into())),
            },
            (None, None) => return Err(Halt::Failed(ticket, missing_input(first_service).into())),
        };

        for policy in &self.layout.steps {
            let step = policy.step;
            let item = self.item_for(&ticket)?;
            if item.artifacts.contains(step.artifact()) {
                ticket = self.dispatch(&ticket, PipelineUpdate::StepReused(step))?;
                continue;
            }
            ticket = self.dispatch(&ticket, PipelineUpdate::Advance(step.stage()))?;
            let outcome = match step_input(&item, step) {
                Some(image) => self.invoke_asset(&step_call(step, image)),
                None => Err(missing_input(step.service())),
            };
            ticket = match outcome {
                Ok(asset) => self.dispatch(&ticket, PipelineUpdate::StepOutput { step, asset })?,
                Err(err) if policy.on_failure == FailurePolicy::Skip => self.dispatch(
                    &ticket,
                    PipelineUpdate::StepSkipped {
                        step,
                        reason: err.to_string(),
                    },
                )?,
                Err(err) => return Err(Halt::Failed(ticket, err.into())),
            };
        }

        ticket = self.dispatch(&ticket, PipelineUpdate::Advance(PipelineStage::Modeling))?;
        let item = self.item_for(&ticket)?;
        let Some(image) = generation_input(&item) else {
            return Err(Halt::Failed(
                ticket,
                missing_input(ServiceKind::MeshGeneration).into(),
            ));
        };
        let call = ServiceCall::GenerateMesh {
            image,
            options: item.generation.clone(),
        };
        match self.adapter.invoke(&call) {
            Ok(ServiceOutput::Asset(mesh)) => self.dispatch(
                &ticket,
                PipelineUpdate::MeshReady {
                    mesh,
                    thumbnail: None,
                },
            ),
            Ok(ServiceOutput::Job(job_id)) => {
                let ticket = self.dispatch(&ticket, PipelineUpdate::JobSubmitted(job_id.clone()))?;
                let polled = poll_until_terminal(
                    self.jobs.as_ref(),
                    &job_id,
                    &self.poll,
                    cancel,
                    |percent, status| {
                        let update = PipelineUpdate::JobProgress {
                            percent,
                            status: status.to_string(),
                        };
                        // Progress is advisory; a stale or unloggable tick changes nothing.
                        let _ = self.dispatch(&ticket, update);
                    },
                );
                match polled {
                    Ok(terminal) => self.dispatch(
                        &ticket,
                        PipelineUpdate::MeshReady {
                            mesh: terminal.mesh,
                            thumbnail: terminal.thumbnail,
                        },
                    ),
                    Err(err) => Err(Halt::Failed(ticket, err.into())),
                }
            }
            Err(err) => Err(Halt::Failed(ticket, err.into())),
        }
    }

    fn run_stylize(&self, ticket: Ticket) -> Result<Ticket, Halt> {
        let item = self.item_for(&ticket)?;
        let Some(image) = item.artifact(ArtifactKind::Screenshot).cloned() else {
            let missing = ActionRejected::MissingArtifact {
                action: PipelineAction::Stylize,
                missing: ArtifactKind::Screenshot,
            };
            return Err(Halt::Failed(ticket, missing.into()));
        };
        let call = ServiceCall::ImageToImage {
            image,
            options: item.stylize.clone(),
        };
        match self.invoke_asset(&call) {
            Ok(asset) => self.dispatch(&ticket, PipelineUpdate::Stylized(asset)),
            Err(err) => Err(Halt::Failed(ticket, err.into())),
        }
    }

    fn state(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install(&self, item: ImageItem) -> Result<ItemId> {
        let id = item.id.clone();
        let payload = json!({
            "source": item.source.as_ref().map(AssetRef::label),
            "origin": serde_json::to_value(&item.origin)?,
            "stage": item.stage.as_str(),
        });
        let removed = self.state().replace_with(item);
        self.cancel_items(&removed);
        for removed_id in &removed {
            self.emit_item_event("item_removed", removed_id, json!({ "reason": "replaced" }))?;
        }
        self.emit_item_event("item_added", &id, payload)?;
        Ok(id)
    }

    fn begin(&self, id: &ItemId, action: PipelineAction) -> Result<Ticket, PipelineError> {
        let (from, ticket) = {
            let mut state = self.state();
            let from = state.get(id).map(|item| item.stage);
            (from, state.begin(id, action)?)
        };
        if from != Some(ticket.stage) {
            if let Err(err) = self.emit_stage_change(&ticket, from, ticket.stage) {
                // The next update that writes an event fails the action.
                let _ = self.note_unlogged(&ticket, &err);
            }
        }
        Ok(ticket)
    }

    /// Applies one update and logs what it changed. A failed event write
    /// fails the action from the stage the update reached.
    fn dispatch(&self, ticket: &Ticket, update: PipelineUpdate) -> Result<Ticket, Halt> {
        let event = update_event(&update);
        let next = self.state().apply(ticket, update)?;
        match self.emit_dispatched(ticket, &next, event) {
            Ok(()) => Ok(next),
            Err(err) => Err(Halt::Failed(next, err.into())),
        }
    }

    fn emit_dispatched(
        &self,
        ticket: &Ticket,
        next: &Ticket,
        event: Option<(&'static str, Value)>,
    ) -> Result<()> {
        if let Some((event_type, payload)) = event {
            self.emit_item_event(event_type, &ticket.item_id, payload)?;
        }
        if next.stage != ticket.stage {
            self.emit_stage_change(next, Some(ticket.stage), next.stage)?;
        }
        Ok(())
    }

    fn finish(&self, result: Result<Ticket, Halt>) -> Result<ActionOutcome, PipelineError> {
        match result {
            Ok(ticket) => Ok(ActionOutcome::Completed(ticket.stage)),
            Err(Halt::Ignored(reason)) => Ok(ActionOutcome::Ignored(reason)),
            Err(Halt::Failed(ticket, err)) => self.fail(&ticket, err),
        }
    }

    fn fail(&self, ticket: &Ticket, err: PipelineError) -> Result<ActionOutcome, PipelineError> {
        let message = err.to_string();
        let applied = self.state().apply(
            ticket,
            PipelineUpdate::Failed {
                message: message.clone(),
            },
        );
        let next = match applied {
            Ok(next) => next,
            // The item already settled; only the error is left to report.
            Err(ignored) if ignored.reason == IgnoreReason::NotApplicable => return Err(err),
            Err(ignored) => return Ok(ActionOutcome::Ignored(ignored.reason)),
        };
        let emitted = self
            .emit_item_event(
                "item_failed",
                &ticket.item_id,
                json!({
                    "action": ticket.action.as_str(),
                    "stage": ticket.stage.as_str(),
                    "reason": err.reason(),
                    "message": message,
                }),
            )
            .and_then(|()| self.emit_stage_change(&next, Some(ticket.stage), next.stage));
        if let Err(log_err) = emitted {
            let _ = self.note_unlogged(&next, &log_err);
        }
        Err(err)
    }

    /// Records a lost event on the item itself.
    fn note_unlogged(&self, ticket: &Ticket, err: &anyhow::Error) -> Result<Ticket, UpdateIgnored> {
        self.state().apply(
            ticket,
            PipelineUpdate::Log(format!("Event log unavailable: {err}")),
        )
    }

    fn emit_stage_change(
        &self,
        ticket: &Ticket,
        from: Option<PipelineStage>,
        to: PipelineStage,
    ) -> Result<()> {
        self.emit_item_event(
            "stage_changed",
            &ticket.item_id,
            json!({
                "action": ticket.action.as_str(),
                "from": from.map(PipelineStage::as_str),
                "to": to.as_str(),
            }),
        )
    }

    /// Current item for a ticket, or the reason the ticket went stale.
    fn item_for(&self, ticket: &Ticket) -> Result<ImageItem, Halt> {
        let state = self.state();
        let Some(item) = state.get(&ticket.item_id) else {
            return Err(Halt::Ignored(IgnoreReason::ItemRemoved));
        };
        if item.epoch != ticket.epoch {
            return Err(Halt::Ignored(IgnoreReason::Superseded));
        }
        Ok(item.clone())
    }

    fn persist_options(
        &self,
        id: &ItemId,
        edit: impl FnOnce(&mut GenerationOptions, &mut StylizeOptions),
    ) -> Result<(), Halt> {
        let mut state = self.state();
        let Some(item) = state.get(id) else {
            return Err(Halt::Ignored(IgnoreReason::ItemRemoved));
        };
        let mut generation = item.generation.clone();
        let mut stylize = item.stylize.clone();
        edit(&mut generation, &mut stylize);
        state
            .set_generation_options(id, generation)
            .and_then(|()| state.set_stylize_options(id, stylize))
            .map_err(|_| Halt::Ignored(IgnoreReason::ItemRemoved))
    }

    fn invoke_asset(&self, call: &ServiceCall) -> Result<AssetRef, ServiceError> {
        match self.adapter.invoke(call)? {
            ServiceOutput::Asset(asset) => Ok(asset),
            ServiceOutput::Job(_) => Err(ServiceError::NoResultField {
                service: call.service(),
            }),
        }
    }

    fn register_cancel(&self, id: &ItemId) -> CancelToken {
        let token = CancelToken::new();
        let mut cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = cancels.insert(id.clone(), token.clone()) {
            previous.cancel();
        }
        token
    }

    fn release_cancel(&self, id: &ItemId, token: &CancelToken) {
        let mut cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
        if cancels.get(id).is_some_and(|current| current.same_as(token)) {
            cancels.remove(id);
        }
    }

    fn cancel_items(&self, ids: &[ItemId]) {
        let mut cancels = self.cancels.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            if let Some(token) = cancels.remove(id) {
                token.cancel();
            }
        }
    }
}

fn update_event(update: &PipelineUpdate) -> Option<(&'static str, Value)> {
    let artifact_set = |kind: ArtifactKind, asset: &AssetRef| {
        Some((
            "artifact_set",
            json!({ "artifact": kind.as_str(), "asset": asset.label() }),
        ))
    };
    match update {
        PipelineUpdate::StepOutput { step, asset } => artifact_set(step.artifact(), asset),
        PipelineUpdate::StepReused(step) => Some((
            "artifact_reused",
            json!({ "artifact": step.artifact().as_str(), "step": step.as_str() }),
        )),
        PipelineUpdate::StepSkipped { step, reason } => Some((
            "step_skipped",
            json!({ "step": step.as_str(), "reason": reason }),
        )),
        PipelineUpdate::JobSubmitted(job_id) => {
            Some(("job_submitted", json!({ "job_id": job_id.as_str() })))
        }
        PipelineUpdate::JobProgress { percent, status } => Some((
            "job_progress",
            json!({ "progress": percent, "status": status }),
        )),
        PipelineUpdate::MeshReady { mesh, thumbnail } => Some((
            "artifact_set",
            json!({
                "artifact": ArtifactKind::Mesh.as_str(),
                "asset": mesh.label(),
                "thumbnail": thumbnail,
            }),
        )),
        PipelineUpdate::Enhanced(asset) => artifact_set(ArtifactKind::EnhancedImage, asset),
        PipelineUpdate::Screenshot(asset) => artifact_set(ArtifactKind::Screenshot, asset),
        PipelineUpdate::Stylized(asset) => artifact_set(ArtifactKind::StylizedImage, asset),
        PipelineUpdate::Advance(_)
        | PipelineUpdate::Uploaded(_)
        | PipelineUpdate::Failed { .. }
        | PipelineUpdate::Log(_) => None,
    }
}

fn step_call(step: PreprocessStep, image: AssetRef) -> ServiceCall {
    match step {
        PreprocessStep::Segmentation => ServiceCall::Segment { image },
        PreprocessStep::DepthEstimation => ServiceCall::EstimateDepth { image },
    }
}

/// Local sources are inlined once and cached on the item for later runs.
fn upload_source(service: ServiceKind, source: &AssetRef) -> Result<AssetRef, ServiceError> {
    if source.is_transferable() {
        return Ok(source.clone());
    }
    input_url(service, source).map(AssetRef::Inline)
}

fn missing_input(service: ServiceKind) -> ServiceError {
    ServiceError::InvalidInput {
        service,
        detail: "no input image available".to_string(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
