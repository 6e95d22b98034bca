//! Client-side evaluation endpoint client.
//!
//! Thin HTTP wrapper: one `REPORT {base}/sdk/evalx/{client_id}/context`
//! per fetch, carrying the evaluation context as JSON and returning every
//! flag already evaluated for it. Fetches happen on [`HttpFlagClient::start`],
//! on [`HttpFlagClient::refresh`] and on `identify`; there is no background
//! stream. Pure parsing and diffing live in free functions for testability.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use flags::{ChangeSet, ErrorKind, EvaluationContext, EvaluationDetail, FlagChange, Reason, SdkLogLevel};
use serde_json::Value;

use super::{ClientOptions, FlagClient, FlagError, FlagMap, ReadyGate, SdkLog};
use crate::events::{ClientEvent, EventPayload, EventRegistry, Handler, SubscriptionId};

const CONNECT_TIMEOUT_SECS: u64 = 5;

// =============================================================================
// CLIENT
// =============================================================================

pub struct HttpFlagClient {
    http: reqwest::Client,
    url: String,
    context: Mutex<EvaluationContext>,
    flags: Mutex<FlagMap>,
    gate: ReadyGate,
    events: EventRegistry,
    sdk: SdkLog,
    closed: AtomicBool,
}

impl HttpFlagClient {
    /// Build a client for `base_url`. No request is made until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::InitFailed`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, options: &ClientOptions, context: EvaluationContext) -> Result<Self, FlagError> {
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| FlagError::InitFailed(e.to_string()))?;
        Ok(Self {
            http,
            url: evaluation_url(base_url, &options.client_id),
            context: Mutex::new(context),
            flags: Mutex::new(BTreeMap::new()),
            gate: ReadyGate::new(),
            events: EventRegistry::new(),
            sdk: SdkLog::new(options.sdk_log_level),
            closed: AtomicBool::new(false),
        })
    }

    /// Fetch the initial flag set, then settle readiness either way.
    ///
    /// # Errors
    ///
    /// Returns the fetch error; the client is then permanently failed.
    pub async fn start(&self) -> Result<(), FlagError> {
        let context = self.current_context();
        match self.fetch(&context).await {
            Ok(flags) => {
                self.sdk.info(&format!("initialized with {} flags", flags.len()));
                *self.flags.lock().unwrap_or_else(PoisonError::into_inner) = flags;
                if self.gate.mark_ready() {
                    self.events.emit(&EventPayload::Ready);
                }
                Ok(())
            }
            Err(e) => {
                self.sdk.error(&format!("initialization failed: {e}"));
                self.gate.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Re-fetch flags for the current context and emit change events for
    /// every key whose value differs. Returns the number of changed flags.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::NotReady`] before a successful start, or the
    /// fetch error. The cached flags are kept on error.
    pub async fn refresh(&self) -> Result<usize, FlagError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FlagError::Closed);
        }
        if !self.gate.is_ready() {
            return Err(FlagError::NotReady);
        }
        let context = self.current_context();
        let fresh = self.fetch(&context).await?;
        let changes = {
            let mut flags = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
            let changes = diff_flags(&flags, &fresh);
            *flags = fresh;
            changes
        };
        self.sdk.debug(&format!("refresh found {} changed flags", changes.len()));
        self.events.emit_changes(&changes);
        Ok(changes.len())
    }

    fn current_context(&self) -> EvaluationContext {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn fetch(&self, context: &EvaluationContext) -> Result<FlagMap, FlagError> {
        let method = reqwest::Method::from_bytes(b"REPORT").map_err(|e| FlagError::Request(e.to_string()))?;
        self.sdk.debug(&format!("fetching flags for {}", context.user.key));

        let response = self
            .http
            .request(method, &self.url)
            .json(context)
            .send()
            .await
            .map_err(|e| FlagError::Request(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| FlagError::Request(e.to_string()))?;

        if status != 200 {
            return Err(FlagError::Response { status, body: text });
        }

        parse_flags(&text)
    }
}

#[async_trait::async_trait]
impl FlagClient for HttpFlagClient {
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
        let cached = self
            .flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        match cached {
            Some(detail) => Ok(detail),
            None => {
                self.sdk.warn(&format!("unknown feature flag {key}; serving default"));
                Ok(EvaluationDetail::fallback(default, ErrorKind::FlagNotFound))
            }
        }
    }

    async fn identify(&self, context: &EvaluationContext) -> Result<(), FlagError> {
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = context.clone();
        self.refresh().await.map(|_| ())
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
            self.sdk.debug("http flag client closed");
            self.events.clear();
        }
    }
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(serde::Deserialize)]
struct WireFlag {
    value: Value,
    #[serde(default)]
    variation: Option<usize>,
    #[serde(default)]
    reason: Option<Value>,
}

// =============================================================================
// PARSING
// =============================================================================

fn evaluation_url(base_url: &str, client_id: &str) -> String {
    format!("{}/sdk/evalx/{client_id}/context?withReasons=true", base_url.trim_end_matches('/'))
}

/// Parse the service's `{flagKey: {value, variation, version, reason}}` body.
///
/// Only a body that is not a JSON object fails as a whole. A flag entry
/// without a value is skipped; a missing or unrecognized reason is recorded
/// as `FALLTHROUGH`.
fn parse_flags(json: &str) -> Result<FlagMap, FlagError> {
    let wire: BTreeMap<String, Value> = serde_json::from_str(json).map_err(|e| FlagError::Parse(e.to_string()))?;
    Ok(wire
        .into_iter()
        .filter_map(|(key, raw)| parse_flag(&key, raw).map(|detail| (key, detail)))
        .collect())
}

fn parse_flag(key: &str, raw: Value) -> Option<EvaluationDetail<Value>> {
    let flag: WireFlag = match serde_json::from_value(raw) {
        Ok(flag) => flag,
        Err(e) => {
            tracing::warn!(key, error = %e, "skipping malformed flag entry");
            return None;
        }
    };
    let reason = match flag.reason.map(serde_json::from_value::<Reason>) {
        None => Reason::Fallthrough,
        Some(Ok(reason)) => reason,
        Some(Err(e)) => {
            tracing::warn!(key, error = %e, "unrecognized evaluation reason; recording FALLTHROUGH");
            Reason::Fallthrough
        }
    };
    Some(EvaluationDetail { value: flag.value, variation_index: flag.variation, reason })
}

/// Value-level differences between two flag sets. Flags that disappeared
/// are reported with a `null` current value.
fn diff_flags(old: &FlagMap, new: &FlagMap) -> ChangeSet {
    let mut changes = ChangeSet::new();
    for (key, detail) in new {
        let previous = old.get(key).map(|d| &d.value);
        if previous != Some(&detail.value) {
            changes.insert(key.clone(), FlagChange { current: detail.value.clone(), previous: previous.cloned() });
        }
    }
    for (key, detail) in old {
        if !new.contains_key(key) {
            changes.insert(key.clone(), FlagChange { current: Value::Null, previous: Some(detail.value.clone()) });
        }
    }
    changes
}

#[cfg(test)]
#[path = "http_test.rs"]
mod tests;
