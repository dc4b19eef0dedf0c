use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid execution request: {reason}")]
    InvalidRequest { reason: String },
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to set up terminal channel: {source}")]
    Channel {
        #[source]
        source: anyhow::Error,
    },
    #[error("no output for {}ms", idle_timeout.as_millis())]
    Timeout { idle_timeout: Duration },
    #[error("terminal channel closed unexpectedly: {source}")]
    ChannelClosed {
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    pub(crate) fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub(crate) fn spawn(program: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Spawn {
            program: program.into(),
            source: source.into(),
        }
    }

    pub(crate) fn channel(source: impl Into<anyhow::Error>) -> Self {
        Self::Channel {
            source: source.into(),
        }
    }

    pub(crate) fn channel_closed(source: std::io::Error) -> Self {
        Self::ChannelClosed { source }
    }

    pub fn kind(&self) -> ExecErrorKind {
        match self {
            Self::InvalidRequest { .. } => ExecErrorKind::InvalidRequest,
            Self::Spawn { .. } => ExecErrorKind::Spawn,
            Self::Channel { .. } => ExecErrorKind::Channel,
            Self::Timeout { .. } => ExecErrorKind::Timeout,
            Self::ChannelClosed { .. } => ExecErrorKind::ChannelClosed,
        }
    }
}

/// Serializable tag for [`ExecError`], carried in execution results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecErrorKind {
    InvalidRequest,
    #[serde(rename = "SpawnError")]
    Spawn,
    #[serde(rename = "ChannelError")]
    Channel,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "ChannelClosedError")]
    ChannelClosed,
}

impl std::fmt::Display for ExecErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::InvalidRequest => "InvalidRequest",
            Self::Spawn => "SpawnError",
            Self::Channel => "ChannelError",
            Self::Timeout => "TimeoutError",
            Self::ChannelClosed => "ChannelClosedError",
        };
        f.write_str(label)
    }
}
