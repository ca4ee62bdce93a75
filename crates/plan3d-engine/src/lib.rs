pub mod adapter;
pub mod assets;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod history;
pub mod poller;

pub use adapter::{HttpServiceAdapter, ServiceAdapter};
pub use assets::AssetFetcher;
pub use capture::{FrameFileRenderer, SceneRenderer};
pub use config::EngineConfig;
pub use coordinator::{ActionOutcome, Coordinator};
pub use history::{select_entry, HistorySource, DEFAULT_HISTORY_PAGE_SIZE};
pub use poller::{CancelToken, JobStatusSource, PollPolicy};
