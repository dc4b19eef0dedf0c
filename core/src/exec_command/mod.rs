mod errors;
mod patterns;
mod request;
mod result;
mod runner;
mod session;

pub use errors::ExecError;
pub use errors::ExecErrorKind;
pub use patterns::CONSOLE_PROMPT_ID;
pub use patterns::Pattern;
pub use patterns::PatternMatch;
pub use patterns::PatternSet;
pub use patterns::SHELL_OPENED_ID;
pub use request::ExecutionRequest;
pub use request::LaunchMode;
pub use result::Completion;
pub use result::ExecFailure;
pub use result::ExecutionResult;
pub use session::CommandSession;
pub use session::SessionState;
pub use session::run_command;
