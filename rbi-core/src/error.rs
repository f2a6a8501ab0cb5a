use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub type RbiResult<T> = Result<T, RbiError>;

/// Why a stream ended. This is what a viewer sees instead of a raw internal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEndReason {
    Expired,
    Closed,
    TransportError,
    EncoderExhausted,
    PageClosed,
}

impl StreamEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEndReason::Expired => "expired",
            StreamEndReason::Closed => "closed",
            StreamEndReason::TransportError => "transport_error",
            StreamEndReason::EncoderExhausted => "encoder_exhausted",
            StreamEndReason::PageClosed => "page_closed",
        }
    }
}

impl Display for StreamEndReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RbiError {
    /// Pool or session caps reached. Rejected, never queued or retried.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Backend hiccup (launch failure, encoder worker crash). Handled internally
    /// unless it hits an explicit user operation.
    #[error("backend failure: {0:#}")]
    TransientBackendFailure(anyhow::Error),
    #[error("terminal failure: {0}")]
    TerminalFailure(StreamEndReason),
}

impl RbiError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RbiError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        RbiError::TransientBackendFailure(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RbiError::NotFound { .. })
    }
}
