//! In-process flag service.
//!
//! Serves a mutable flag table with the same surface as the remote client.
//! The offline demo drives it from shell commands; tests drive it directly.
//! Every evaluation ignores targeting and serves the table entry as-is.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use flags::{ChangeSet, ErrorKind, EvaluationContext, EvaluationDetail, FlagChange, Reason, SdkLogLevel};
use serde_json::Value;

use super::{ClientOptions, FlagClient, FlagError, FlagMap, ReadyGate, SdkLog};
use crate::events::{ClientEvent, EventPayload, EventRegistry, Handler, SubscriptionId};

pub struct MemoryFlagClient {
    flags: Mutex<FlagMap>,
    context: Mutex<Option<EvaluationContext>>,
    gate: ReadyGate,
    events: EventRegistry,
    sdk: SdkLog,
    closed: AtomicBool,
}

impl MemoryFlagClient {
    #[must_use]
    pub fn new(options: &ClientOptions) -> Self {
        let sdk = SdkLog::new(options.sdk_log_level);
        sdk.debug(&format!("memory flag client created for {}", options.client_id));
        Self {
            flags: Mutex::new(BTreeMap::new()),
            context: Mutex::new(None),
            gate: ReadyGate::new(),
            events: EventRegistry::new(),
            sdk,
            closed: AtomicBool::new(false),
        }
    }

    /// Seed a flag before anyone is listening. Served with a `FALLTHROUGH` reason.
    #[must_use]
    pub fn with_flag(self, key: &str, value: Value) -> Self {
        self.lock_flags().insert(key.to_owned(), served(value));
        self
    }

    /// Seed several flags at once.
    #[must_use]
    pub fn with_flags(self, flags: impl IntoIterator<Item = (String, Value)>) -> Self {
        {
            let mut table = self.lock_flags();
            for (key, value) in flags {
                table.insert(key, served(value));
            }
        }
        self
    }

    /// Push a new value for `key`. Emits `change` and `change:<key>` only
    /// when the value actually differs. Returns whether it did.
    pub fn set_flag(&self, key: &str, value: Value) -> bool {
        self.set_flag_detail(key, served(value))
    }

    /// Push a new value with an explicit reason.
    pub fn set_flag_detail(&self, key: &str, detail: EvaluationDetail<Value>) -> bool {
        let (previous, current) = {
            let mut table = self.lock_flags();
            let previous = table.get(key).map(|d| d.value.clone());
            if previous.as_ref() == Some(&detail.value) {
                table.insert(key.to_owned(), detail);
                return false;
            }
            let current = detail.value.clone();
            table.insert(key.to_owned(), detail);
            (previous, current)
        };

        self.sdk.debug(&format!("flag {key} changed to {current}"));
        let mut changes = ChangeSet::new();
        changes.insert(key.to_owned(), FlagChange { current, previous });
        self.events.emit_changes(&changes);
        true
    }

    /// Current values, for carrying the table across a client rebuild.
    #[must_use]
    pub fn flags(&self) -> BTreeMap<String, Value> {
        self.lock_flags()
            .iter()
            .map(|(k, d)| (k.clone(), d.value.clone()))
            .collect()
    }

    /// Finish initializing and fire `ready`.
    pub fn mark_ready(&self) {
        if self.gate.mark_ready() {
            self.sdk.info("memory flag client ready");
            self.events.emit(&EventPayload::Ready);
        }
    }

    pub fn fail_initialization(&self, reason: &str) {
        if self.gate.fail(reason) {
            self.sdk.error(&format!("memory flag client failed to initialize: {reason}"));
        }
    }

    /// Context last passed to [`FlagClient::identify`].
    #[must_use]
    pub fn current_context(&self) -> Option<EvaluationContext> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_flags(&self) -> std::sync::MutexGuard<'_, FlagMap> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn served(value: Value) -> EvaluationDetail<Value> {
    EvaluationDetail { value, variation_index: None, reason: Reason::Fallthrough }
}

#[async_trait::async_trait]
impl FlagClient for MemoryFlagClient {
    async fn wait_for_initialization(&self, timeout: Duration) -> Result<(), FlagError> {
        self.gate.wait(timeout).await
    }

    async fn variation_detail(
        &self,
        key: &str,
        _context: &EvaluationContext,
        default: Value,
    ) -> Result<EvaluationDetail<Value>, FlagError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FlagError::Closed);
        }
        if !self.gate.is_ready() {
            self.sdk.warn(&format!("flag {key} evaluated before the client was ready; serving default"));
            return Ok(EvaluationDetail::fallback(default, ErrorKind::ClientNotReady));
        }
        match self.lock_flags().get(key) {
            Some(detail) => Ok(detail.clone()),
            None => {
                self.sdk.warn(&format!("unknown feature flag {key}; serving default"));
                Ok(EvaluationDetail::fallback(default, ErrorKind::FlagNotFound))
            }
        }
    }

    async fn identify(&self, context: &EvaluationContext) -> Result<(), FlagError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FlagError::Closed);
        }
        self.sdk.debug(&format!("identify {}", context.user.key));
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(context.clone());
        Ok(())
    }

    fn on(&self, event: ClientEvent, handler: Handler) -> SubscriptionId {
        self.events.on(event, handler)
    }

    fn off(&self, id: SubscriptionId) {
        self.events.off(id);
    }

    fn sdk_log_level(&self) -> SdkLogLevel {
        self.sdk.level()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sdk.debug("memory flag client closed");
            self.events.clear();
        }
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
