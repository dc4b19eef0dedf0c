use serde::Serialize;

use super::errors::ExecError;
use super::errors::ExecErrorKind;
use super::patterns::PatternMatch;

/// Why an execution step stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Completion {
    /// The process reached end of output and was reaped.
    Completed,
    /// A pattern matched; the process is alive and waiting for a line.
    AwaitingInput,
    /// No output arrived within the idle timeout; the process was terminated.
    TimedOut,
    Failed,
}

impl std::fmt::Display for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Completed => "completed",
            Self::AwaitingInput => "awaiting-input",
            Self::TimedOut => "timed-out",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecFailure {
    pub kind: ExecErrorKind,
    pub detail: String,
}

impl From<&ExecError> for ExecFailure {
    fn from(err: &ExecError) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
        }
    }
}

/// Outcome of one execution step.
///
/// `output` holds the sanitized text produced since the previous step of
/// the same session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub output: String,
    pub completion: Completion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched: Option<PatternMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecFailure>,
}

impl ExecutionResult {
    pub(crate) fn completed(output: String, exit_code: Option<i32>) -> Self {
        Self {
            output,
            completion: Completion::Completed,
            matched: None,
            exit_code,
            error: None,
        }
    }

    pub(crate) fn awaiting_input(output: String, matched: PatternMatch) -> Self {
        Self {
            output,
            completion: Completion::AwaitingInput,
            matched: Some(matched),
            exit_code: None,
            error: None,
        }
    }

    pub(crate) fn timed_out(output: String, err: &ExecError, exit_code: Option<i32>) -> Self {
        Self {
            output,
            completion: Completion::TimedOut,
            matched: None,
            exit_code,
            error: Some(err.into()),
        }
    }

    pub(crate) fn failed(output: String, err: &ExecError) -> Self {
        Self {
            output,
            completion: Completion::Failed,
            matched: None,
            exit_code: None,
            error: Some(err.into()),
        }
    }

    /// A `failed` result for a command that never produced output.
    pub fn from_error(err: &ExecError) -> Self {
        Self::failed(String::new(), err)
    }

    pub fn error_kind(&self) -> Option<ExecErrorKind> {
        self.error.as_ref().map(|failure| failure.kind)
    }

    pub fn is_spawn_failure(&self) -> bool {
        self.error_kind() == Some(ExecErrorKind::Spawn)
    }
}
