mod parser;
mod registry;

pub use parser::{parse_intent, Intent};
pub use registry::CHAT_HELP_COMMANDS;
