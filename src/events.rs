//! Named-event observer registry shared by the flag clients.
//!
//! DESIGN
//! ======
//! Handlers are kept in one `Vec` in registration order, tagged with the
//! event they listen to. `emit` snapshots the matching handlers under the
//! lock, releases it, then calls each in order, so a handler may subscribe
//! or unsubscribe without deadlocking. A handler removed during delivery
//! still sees the event already in flight.
//!
//! Unsubscribing is idempotent: an unknown or already-removed id is ignored.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use flags::{ChangeSet, FlagChange};

const CHANGE_PREFIX: &str = "change:";

/// An event name a handler can listen to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    /// The client finished initializing.
    Ready,
    /// One or more flags changed; payload carries all of them.
    Change,
    /// The named flag changed.
    FlagChange(String),
}

impl ClientEvent {
    #[must_use]
    pub fn flag(key: impl Into<String>) -> Self {
        Self::FlagChange(key.into())
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Change => f.write_str("change"),
            Self::FlagChange(key) => write!(f, "{CHANGE_PREFIX}{key}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event name: {0:?}")]
pub struct UnknownEvent(pub String);

impl FromStr for ClientEvent {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Self::Ready),
            "change" => Ok(Self::Change),
            _ => match s.strip_prefix(CHANGE_PREFIX) {
                Some(key) if !key.is_empty() => Ok(Self::FlagChange(key.to_owned())),
                _ => Err(UnknownEvent(s.to_owned())),
            },
        }
    }
}

/// What a handler receives.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    Ready,
    Change(ChangeSet),
    FlagChange { key: String, change: FlagChange },
}

impl EventPayload {
    /// The event this payload is delivered under.
    #[must_use]
    pub fn event(&self) -> ClientEvent {
        match self {
            Self::Ready => ClientEvent::Ready,
            Self::Change(_) => ClientEvent::Change,
            Self::FlagChange { key, .. } => ClientEvent::FlagChange(key.clone()),
        }
    }
}

/// Callback invoked on event delivery.
pub type Handler = Arc<dyn Fn(&EventPayload) + Send + Sync>;

/// Opaque handle returned by [`EventRegistry::on`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    handlers: Vec<(SubscriptionId, ClientEvent, Handler)>,
}

impl EventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`.
    pub fn on(&self, event: ClientEvent, handler: Handler) -> SubscriptionId {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.handlers.push((id, event, handler));
        id
    }

    /// Remove one subscription. Returns whether it was still registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = inner.handlers.len();
        inner.handlers.retain(|(sid, _, _)| *sid != id);
        inner.handlers.len() != before
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .clear();
    }

    /// Deliver `payload` to every handler of its event, in registration order.
    /// Returns the number of handlers invoked.
    pub fn emit(&self, payload: &EventPayload) -> usize {
        let event = payload.event();
        let targets: Vec<Handler> = {
            let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            inner
                .handlers
                .iter()
                .filter(|(_, ev, _)| *ev == event)
                .map(|(_, _, h)| Arc::clone(h))
                .collect()
        };
        for handler in &targets {
            handler(payload);
        }
        targets.len()
    }

    /// Deliver a batch of changes: the aggregate `change` event first, then
    /// one `change:<key>` per flag in key order.
    pub fn emit_changes(&self, changes: &ChangeSet) -> usize {
        if changes.is_empty() {
            return 0;
        }
        let mut delivered = self.emit(&EventPayload::Change(changes.clone()));
        for (key, change) in changes {
            delivered += self.emit(&EventPayload::FlagChange { key: key.clone(), change: change.clone() });
        }
        delivered
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod tests;
