//! Flag-state synchronizer.
//!
//! DESIGN
//! ======
//! Owns the link between one [`FlagClient`] and the rest of the app: waits
//! for readiness under a timeout, evaluates flags without ever surfacing an
//! error, keeps a two-entry cache of the level flags, and fans change
//! notifications out to subscribers.
//!
//! The SDK-level flag is special. Its value is fixed into a client at
//! construction, so a new value is persisted to local storage and a single
//! [`RestartRequest`] is sent to the composition root, which drops this
//! synchronizer and its client and builds fresh ones.
//!
//! STATE MACHINE
//! =============
//! `Uninitialized -> AwaitingReady -> Ready | Failed`. `Failed` is terminal;
//! nothing retries. A restart starts over with a new synchronizer.
//!
//! Cache writes happen only on the event-delivery path (readiness and change
//! handlers). Out-of-domain values are logged and never cached or persisted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use flags::{
    ChangeSet, ConsoleLevel, ErrorKind, EvaluationContext, EvaluationDetail, FlagChange, LevelError, Reason,
    SdkLogLevel,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::{FlagClient, FlagError};
use crate::events::{ClientEvent, EventPayload, SubscriptionId};
use crate::storage::{KeyValueStore, SDK_LOG_LEVEL_KEY, store_sdk_log_level};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    AwaitingReady,
    Ready,
    Failed(String),
}

/// Keys of the two flags the synchronizer understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagKeys {
    pub console: String,
    pub sdk: String,
}

/// Last known value of a flag. `reason` is absent when the value arrived
/// through a change push rather than an evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedFlag<T> {
    pub value: T,
    pub reason: Option<Reason>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagCache {
    pub console: Option<CachedFlag<ConsoleLevel>>,
    pub sdk: Option<CachedFlag<SdkLogLevel>>,
}

/// Ask the composition root to rebuild the flag client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartRequest {
    pub sdk_log_level: SdkLogLevel,
    /// Previously persisted level, `None` if nothing valid was stored.
    pub previous: Option<SdkLogLevel>,
}

/// Sends at most one restart request per synchronizer.
#[derive(Clone)]
struct RestartSignal {
    tx: mpsc::UnboundedSender<RestartRequest>,
    sent: Arc<AtomicBool>,
}

impl RestartSignal {
    fn send(&self, request: RestartRequest) -> bool {
        if self.sent.swap(true, Ordering::AcqRel) {
            debug!(level = %request.sdk_log_level, "restart already pending");
            return false;
        }
        self.tx.send(request).is_ok()
    }
}

// =============================================================================
// SYNCHRONIZER
// =============================================================================

pub struct Synchronizer {
    keys: FlagKeys,
    local: Arc<dyn KeyValueStore>,
    restart: RestartSignal,
    init_timeout: Duration,
    state: Mutex<SyncState>,
    cache: Arc<Mutex<FlagCache>>,
    client: Option<Arc<dyn FlagClient>>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl Synchronizer {
    #[must_use]
    pub fn new(
        keys: FlagKeys,
        local: Arc<dyn KeyValueStore>,
        restart_tx: mpsc::UnboundedSender<RestartRequest>,
        init_timeout: Duration,
    ) -> Self {
        Self {
            keys,
            local,
            restart: RestartSignal { tx: restart_tx, sent: Arc::new(AtomicBool::new(false)) },
            init_timeout,
            state: Mutex::new(SyncState::Uninitialized),
            cache: Arc::new(Mutex::new(FlagCache::default())),
            client: None,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Attach `client`, wait for it to become ready and seed the cache.
    ///
    /// Change handlers go in before the wait so no push is missed.
    ///
    /// # Errors
    ///
    /// Returns the readiness error (timeout or failure); the synchronizer is
    /// then in the terminal [`SyncState::Failed`] state.
    pub async fn initialize(&mut self, client: Arc<dyn FlagClient>, context: &EvaluationContext) -> Result<(), FlagError> {
        self.set_state(SyncState::AwaitingReady);
        self.client = Some(Arc::clone(&client));
        self.install_handlers(client.as_ref());

        if let Err(e) = client.wait_for_initialization(self.init_timeout).await {
            error!(error = %e, code = e.error_code(), "flag client failed to initialize");
            self.set_state(SyncState::Failed(e.to_string()));
            return Err(e);
        }
        self.set_state(SyncState::Ready);

        let console = self.console_level(context).await;
        let sdk = self.evaluate(&self.keys.sdk, json!(SdkLogLevel::default().as_str()), context).await;
        info!(
            console_key = %self.keys.console,
            console = %console.value.describe(),
            sdk_key = %self.keys.sdk,
            sdk = %sdk.value,
            "flag client ready"
        );

        {
            let mut cache = self.lock_cache();
            cache.console = Some(CachedFlag { value: console.value, reason: Some(console.reason) });
        }
        if sdk.is_fallback() {
            warn!(key = %self.keys.sdk, reason = %sdk.reason, "SDK log level flag unavailable; keeping stored level");
        } else {
            apply_sdk_level(&self.keys.sdk, &sdk.value, Some(sdk.reason), &self.cache, self.local.as_ref(), &self.restart);
        }
        Ok(())
    }

    /// Current value of `key` with the reason it was served.
    ///
    /// Never fails: errors are logged and the default comes back with an
    /// `ERROR` reason. Outside the ready state the client is not called.
    pub async fn evaluate(&self, key: &str, default: Value, context: &EvaluationContext) -> EvaluationDetail<Value> {
        let client = match (&self.client, self.state()) {
            (Some(client), SyncState::Ready) => client,
            (_, state) => {
                debug!(key, ?state, "evaluation skipped; flag client not ready");
                return EvaluationDetail::fallback(default, ErrorKind::ClientNotReady);
            }
        };
        match client.variation_detail(key, context, default.clone()).await {
            Ok(detail) => detail,
            Err(e) => {
                warn!(key, error = %e, code = e.error_code(), "flag evaluation failed; serving default");
                EvaluationDetail::fallback(default, e.error_kind())
            }
        }
    }

    /// Console level for `context`, `INFO` when unavailable or out of domain.
    pub async fn console_level(&self, context: &EvaluationContext) -> EvaluationDetail<ConsoleLevel> {
        let default = ConsoleLevel::default();
        self.evaluate_level(&self.keys.console, default, json!(default.as_u8()), context, ConsoleLevel::from_value)
            .await
    }

    /// SDK level for `context`, `info` when unavailable or out of domain.
    pub async fn sdk_level(&self, context: &EvaluationContext) -> EvaluationDetail<SdkLogLevel> {
        let default = SdkLogLevel::default();
        self.evaluate_level(&self.keys.sdk, default, json!(default.as_str()), context, SdkLogLevel::from_value)
            .await
    }

    /// Evaluate `key` and narrow the raw value with `parse`. A value outside
    /// the domain falls back to `default` with a `WRONG_TYPE` reason.
    async fn evaluate_level<T>(
        &self,
        key: &str,
        default: T,
        raw_default: Value,
        context: &EvaluationContext,
        parse: fn(&Value) -> Result<T, LevelError>,
    ) -> EvaluationDetail<T> {
        let detail = self.evaluate(key, raw_default, context).await;
        match parse(&detail.value) {
            Ok(level) => detail.map(|_| level),
            Err(e) => {
                warn!(key, error = %e, "rejecting out-of-domain flag value");
                EvaluationDetail::fallback(default, ErrorKind::WrongType)
            }
        }
    }

    /// Call `handler` every time the service pushes a new value for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::NotReady`] before a client is attached.
    pub fn on_change<F>(&self, key: &str, handler: F) -> Result<SubscriptionId, FlagError>
    where
        F: Fn(&FlagChange) + Send + Sync + 'static,
    {
        let client = self.client.as_ref().ok_or(FlagError::NotReady)?;
        let id = client.on(
            ClientEvent::flag(key),
            Arc::new(move |payload: &EventPayload| {
                if let EventPayload::FlagChange { change, .. } = payload {
                    handler(change);
                }
            }),
        );
        self.track(id);
        Ok(id)
    }

    /// Call `handler` with every batch of changes.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::NotReady`] before a client is attached.
    pub fn on_any_change<F>(&self, handler: F) -> Result<SubscriptionId, FlagError>
    where
        F: Fn(&ChangeSet) + Send + Sync + 'static,
    {
        let client = self.client.as_ref().ok_or(FlagError::NotReady)?;
        let id = client.on(
            ClientEvent::Change,
            Arc::new(move |payload: &EventPayload| {
                if let EventPayload::Change(changes) = payload {
                    handler(changes);
                }
            }),
        );
        self.track(id);
        Ok(id)
    }

    /// Idempotent; safe after the client is gone.
    pub fn off(&self, id: SubscriptionId) {
        self.lock_subscriptions().retain(|s| *s != id);
        if let Some(client) = &self.client {
            client.off(id);
        }
    }

    /// Remove every subscription this synchronizer installed.
    pub fn shutdown(&self) {
        let ids: Vec<SubscriptionId> = self.lock_subscriptions().drain(..).collect();
        if let Some(client) = &self.client {
            for id in &ids {
                client.off(*id);
            }
        }
        debug!(count = ids.len(), "synchronizer subscriptions removed");
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn keys(&self) -> &FlagKeys {
        &self.keys
    }

    #[must_use]
    pub fn cache(&self) -> FlagCache {
        self.lock_cache().clone()
    }

    /// Cached flags rendered for display, console level as `N (LABEL)`.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, String)> {
        let cache = self.cache();
        let console = cache
            .console
            .map_or_else(|| "unset".to_owned(), |c| c.value.describe());
        let sdk = cache.sdk.map_or_else(|| "unset".to_owned(), |c| c.value.to_string());
        vec![(self.keys.console.clone(), console), (self.keys.sdk.clone(), sdk)]
    }

    fn install_handlers(&self, client: &dyn FlagClient) {
        let cache = Arc::clone(&self.cache);
        let console_key = self.keys.console.clone();
        let console_id = client.on(
            ClientEvent::flag(self.keys.console.clone()),
            Arc::new(move |payload: &EventPayload| {
                if let EventPayload::FlagChange { change, .. } = payload {
                    cache_console_level(&console_key, &change.current, &cache);
                }
            }),
        );

        let cache = Arc::clone(&self.cache);
        let sdk_key = self.keys.sdk.clone();
        let local = Arc::clone(&self.local);
        let restart = self.restart.clone();
        let sdk_id = client.on(
            ClientEvent::flag(self.keys.sdk.clone()),
            Arc::new(move |payload: &EventPayload| {
                if let EventPayload::FlagChange { change, .. } = payload {
                    apply_sdk_level(&sdk_key, &change.current, None, &cache, local.as_ref(), &restart);
                }
            }),
        );

        self.track(console_id);
        self.track(sdk_id);
    }

    fn set_state(&self, next: SyncState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(from = ?*state, to = ?next, "synchronizer state");
        *state = next;
    }

    fn track(&self, id: SubscriptionId) {
        self.lock_subscriptions().push(id);
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, FlagCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<SubscriptionId>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// CHANGE HANDLING
// =============================================================================

fn cache_console_level(key: &str, value: &Value, cache: &Mutex<FlagCache>) {
    match ConsoleLevel::from_value(value) {
        Ok(level) => {
            info!(key, level = %level.describe(), "console level changed");
            cache.lock().unwrap_or_else(PoisonError::into_inner).console = Some(CachedFlag { value: level, reason: None });
        }
        Err(e) => warn!(key, error = %e, "rejecting console level change"),
    }
}

/// Cache a newly observed SDK level and, if it differs from the persisted
/// one, persist it and request a restart. Returns whether a restart was sent.
fn apply_sdk_level(
    key: &str,
    value: &Value,
    reason: Option<Reason>,
    cache: &Mutex<FlagCache>,
    local: &dyn KeyValueStore,
    restart: &RestartSignal,
) -> bool {
    let level = match SdkLogLevel::from_value(value) {
        Ok(level) => level,
        Err(e) => {
            warn!(key, error = %e, "rejecting SDK log level");
            return false;
        }
    };
    cache.lock().unwrap_or_else(PoisonError::into_inner).sdk = Some(CachedFlag { value: level, reason });

    let stored = local.get(SDK_LOG_LEVEL_KEY);
    if stored.as_deref() == Some(level.as_str()) {
        debug!(key, %level, "SDK log level unchanged");
        return false;
    }

    match store_sdk_log_level(local, level.as_str()) {
        Ok(true) => {}
        Ok(false) => return false,
        Err(e) => {
            error!(key, error = %e, "failed to persist SDK log level; not restarting");
            return false;
        }
    }

    let previous = stored.and_then(|raw| raw.parse().ok());
    info!(key, %level, ?previous, "SDK log level changed; restarting flag client");
    restart.send(RestartRequest { sdk_log_level: level, previous })
}

#[cfg(test)]
#[path = "sync_test.rs"]
mod tests;
