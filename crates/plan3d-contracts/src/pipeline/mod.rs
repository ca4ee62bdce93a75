mod item;
mod policy;
mod state;

pub use item::{
    snap_texture_resolution, ArtifactKind, Artifacts, GenerationOptions, ImageItem, ItemId,
    ItemOrigin, PipelineAction, PipelineStage, StylizeOptions, SymmetryMode,
    DEFAULT_ENHANCE_PROMPT, DEFAULT_STYLIZE_PROMPT, DEFAULT_TARGET_POLYCOUNT,
    DEFAULT_TEXTURE_RESOLUTION,
};
pub use policy::{
    base_input, generation_input, step_input, FailurePolicy, PipelineLayout, PreprocessStep,
    StepPolicy,
};
pub use state::{PipelineState, PipelineUpdate, Ticket};
