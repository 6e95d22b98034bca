//! Flag client types: errors, construction options, flag tables.

use std::collections::BTreeMap;
use std::time::Duration;

use flags::{ErrorKind, EvaluationDetail, SdkLogLevel};
use serde_json::Value;

use crate::config::AppConfig;

/// Evaluated flags keyed by flag key.
pub type FlagMap = BTreeMap<String, EvaluationDetail<Value>>;

// =============================================================================
// ERROR
// =============================================================================

/// Errors produced by flag client operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlagError {
    /// An evaluation was attempted before the client became ready.
    #[error("flag client is not ready")]
    NotReady,

    /// The client did not become ready within the allotted time.
    #[error("flag client did not initialize within {ms}ms")]
    InitTimeout { ms: u64 },

    /// The client gave up initializing.
    #[error("flag client failed to initialize: {0}")]
    InitFailed(String),

    /// The HTTP request to the evaluation service failed.
    #[error("flag request failed: {0}")]
    Request(String),

    /// The evaluation service returned a non-success HTTP status.
    #[error("flag service error: status {status}")]
    Response { status: u16, body: String },

    /// The evaluation service response could not be deserialized.
    #[error("flag response parse failed: {0}")]
    Parse(String),

    /// The client has been closed.
    #[error("flag client is closed")]
    Closed,
}

impl FlagError {
    /// Grepable code for logs.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotReady => "E_NOT_READY",
            Self::InitTimeout { .. } => "E_INIT_TIMEOUT",
            Self::InitFailed(_) => "E_INIT_FAILED",
            Self::Request(_) => "E_REQUEST",
            Self::Response { .. } => "E_RESPONSE",
            Self::Parse(_) => "E_PARSE",
            Self::Closed => "E_CLOSED",
        }
    }

    /// The reason kind reported when this error forces a fallback value.
    #[must_use]
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            Self::NotReady | Self::InitTimeout { .. } | Self::InitFailed(_) | Self::Closed => {
                ErrorKind::ClientNotReady
            }
            Self::Parse(_) => ErrorKind::MalformedFlag,
            Self::Request(_) | Self::Response { .. } => ErrorKind::Exception,
        }
    }
}

// =============================================================================
// OPTIONS
// =============================================================================

/// Construction-time client settings. Fixed for the client's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub client_id: String,
    /// Verbosity of the client's own diagnostics.
    pub sdk_log_level: SdkLogLevel,
    pub request_timeout: Duration,
}

impl ClientOptions {
    #[must_use]
    pub fn from_config(config: &AppConfig, sdk_log_level: SdkLogLevel) -> Self {
        Self { client_id: config.client_id.clone(), sdk_log_level, request_timeout: config.request_timeout }
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
