//! Root of the `intrusion-core` library.

// Prevent accidental direct writes to stdout/stderr in library code. All
// user-visible output must go through the front end or `tracing`.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod config;
pub mod conversation;
pub mod exec_command;
pub mod pilot;

pub use config::Config;
pub use config::ConfigOverrides;
pub use conversation::ChatCompletionsConversation;
pub use conversation::Conversation;
pub use exec_command::CommandSession;
pub use exec_command::ExecutionRequest;
pub use exec_command::ExecutionResult;
pub use exec_command::run_command;
pub use pilot::Pilot;
pub use pilot::PilotEvent;
pub use pilot::PilotOutcome;
