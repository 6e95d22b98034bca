//! Remote flag-evaluation client seam.
//!
//! DESIGN
//! ======
//! [`FlagClient`] is the only surface the synchronizer sees. Two
//! implementations exist: [`MemoryFlagClient`] serves a flag table held in
//! process (offline demo mode and tests) and [`HttpFlagClient`] fetches
//! evaluated flags from a client-side evaluation endpoint.
//!
//! A client's own diagnostics go through [`SdkLog`], whose level is fixed at
//! construction. Changing it means building a new client.

pub mod http;
pub mod memory;
pub mod types;

use std::time::Duration;

use flags::{EvaluationContext, EvaluationDetail, SdkLogLevel};
use serde_json::Value;
use tokio::sync::watch;

use crate::events::{ClientEvent, Handler, SubscriptionId};
pub use http::HttpFlagClient;
pub use memory::MemoryFlagClient;
pub use types::{ClientOptions, FlagError, FlagMap};

/// Remote flag-evaluation client.
#[async_trait::async_trait]
pub trait FlagClient: Send + Sync {
    /// Resolve once the client is ready, or fail after `timeout`.
    async fn wait_for_initialization(&self, timeout: Duration) -> Result<(), FlagError>;

    /// Evaluate `key` for `context`, with the reason the value was served.
    ///
    /// Unknown flags and a not-yet-ready client resolve to `default` with an
    /// error reason. Transport failures are returned as `Err`.
    async fn variation_detail(
        &self,
        key: &str,
        context: &EvaluationContext,
        default: Value,
    ) -> Result<EvaluationDetail<Value>, FlagError>;

    /// Evaluate `key` for `context`, value only.
    async fn variation(&self, key: &str, context: &EvaluationContext, default: Value) -> Result<Value, FlagError> {
        Ok(self.variation_detail(key, context, default).await?.value)
    }

    /// Switch the targeted context (login / logout).
    async fn identify(&self, context: &EvaluationContext) -> Result<(), FlagError>;

    fn on(&self, event: ClientEvent, handler: Handler) -> SubscriptionId;

    /// Unknown or already-removed ids are ignored.
    fn off(&self, id: SubscriptionId);

    /// Level the client's own diagnostics were built with.
    fn sdk_log_level(&self) -> SdkLogLevel;

    /// Tear the client down. Later evaluations fail with [`FlagError::Closed`].
    async fn close(&self);
}

// =============================================================================
// SDK DIAGNOSTICS
// =============================================================================

/// `tracing` target for flag client diagnostics.
pub const SDK_TARGET: &str = "flagdemo::sdk";

/// Level-filtered diagnostics emitted by a flag client.
#[derive(Clone, Copy, Debug)]
pub struct SdkLog {
    level: SdkLogLevel,
}

impl SdkLog {
    #[must_use]
    pub fn new(level: SdkLogLevel) -> Self {
        Self { level }
    }

    #[must_use]
    pub fn level(self) -> SdkLogLevel {
        self.level
    }

    pub fn error(self, message: &str) {
        if self.level.allows(SdkLogLevel::Error) {
            tracing::error!(target: SDK_TARGET, "{message}");
        }
    }

    pub fn warn(self, message: &str) {
        if self.level.allows(SdkLogLevel::Warn) {
            tracing::warn!(target: SDK_TARGET, "{message}");
        }
    }

    pub fn info(self, message: &str) {
        if self.level.allows(SdkLogLevel::Info) {
            tracing::info!(target: SDK_TARGET, "{message}");
        }
    }

    pub fn debug(self, message: &str) {
        if self.level.allows(SdkLogLevel::Debug) {
            tracing::debug!(target: SDK_TARGET, "{message}");
        }
    }
}

// =============================================================================
// READINESS
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
enum InitState {
    Pending,
    Ready,
    Failed(String),
}

/// One-shot readiness latch: pending until marked ready or failed, then fixed.
#[derive(Debug)]
pub(crate) struct ReadyGate {
    tx: watch::Sender<InitState>,
}

impl ReadyGate {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(InitState::Pending);
        Self { tx }
    }

    /// Returns `true` on the pending -> ready transition only.
    pub(crate) fn mark_ready(&self) -> bool {
        self.settle(InitState::Ready)
    }

    /// Returns `true` on the pending -> failed transition only.
    pub(crate) fn fail(&self, reason: impl Into<String>) -> bool {
        self.settle(InitState::Failed(reason.into()))
    }

    pub(crate) fn is_ready(&self) -> bool {
        *self.tx.borrow() == InitState::Ready
    }

    fn settle(&self, next: InitState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == InitState::Pending {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    pub(crate) async fn wait(&self, timeout: Duration) -> Result<(), FlagError> {
        let mut rx = self.tx.subscribe();
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(|s| *s != InitState::Pending)).await {
            Err(_) => return Err(FlagError::InitTimeout { ms: millis(timeout) }),
            Ok(Err(_)) => return Err(FlagError::Closed),
            Ok(Ok(state)) => state.clone(),
        };
        match outcome {
            InitState::Ready => Ok(()),
            InitState::Failed(reason) => Err(FlagError::InitFailed(reason)),
            InitState::Pending => Err(FlagError::NotReady),
        }
    }
}

pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
