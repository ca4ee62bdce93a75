pub mod assets;
pub mod commands;
pub mod errors;
pub mod events;
pub mod history;
pub mod jobs;
pub mod pipeline;
pub mod services;
