use serde_json::json;

use super::*;

fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Handler) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let make = {
        let log = Arc::clone(&log);
        move |name: &'static str| -> Handler {
            let log = Arc::clone(&log);
            Arc::new(move |payload: &EventPayload| {
                log.lock().unwrap().push(format!("{name}:{}", payload.event()));
            })
        }
    };
    (log, make)
}

fn console_change(current: u64) -> EventPayload {
    EventPayload::FlagChange {
        key: "console-log-level".into(),
        change: FlagChange { current: json!(current), previous: Some(json!(3)) },
    }
}

// =============================================================================
// ClientEvent names
// =============================================================================

#[test]
fn event_names_round_trip() {
    for name in ["ready", "change", "change:sdk-log-level"] {
        let event: ClientEvent = name.parse().unwrap();
        assert_eq!(event.to_string(), name);
    }
    assert_eq!("change:console-log-level".parse::<ClientEvent>().unwrap(), ClientEvent::flag("console-log-level"));
}

#[test]
fn event_names_reject_unknown() {
    assert!("failed".parse::<ClientEvent>().is_err());
    assert!("change:".parse::<ClientEvent>().is_err());
    assert!("Ready".parse::<ClientEvent>().is_err());
}

// =============================================================================
// Delivery
// =============================================================================

#[test]
fn emit_reaches_all_subscribers_in_registration_order() {
    let registry = EventRegistry::new();
    let (log, make) = recorder();
    registry.on(ClientEvent::flag("console-log-level"), make("a"));
    registry.on(ClientEvent::flag("console-log-level"), make("b"));
    registry.on(ClientEvent::flag("sdk-log-level"), make("other"));

    assert_eq!(registry.emit(&console_change(4)), 2);
    assert_eq!(*log.lock().unwrap(), vec!["a:change:console-log-level", "b:change:console-log-level"]);
}

#[test]
fn unsubscribed_handler_stops_receiving_others_continue() {
    let registry = EventRegistry::new();
    let (log, make) = recorder();
    let a = registry.on(ClientEvent::flag("console-log-level"), make("a"));
    registry.on(ClientEvent::flag("console-log-level"), make("b"));

    registry.emit(&console_change(4));
    assert!(registry.off(a));
    registry.emit(&console_change(5));

    assert_eq!(
        *log.lock().unwrap(),
        vec!["a:change:console-log-level", "b:change:console-log-level", "b:change:console-log-level"]
    );
}

#[test]
fn off_is_idempotent() {
    let registry = EventRegistry::new();
    let (_log, make) = recorder();
    let id = registry.on(ClientEvent::Ready, make("a"));

    assert!(registry.off(id));
    assert!(!registry.off(id));
    registry.clear();
    assert!(!registry.off(id));
}

#[test]
fn off_removes_only_that_subscription() {
    let registry = EventRegistry::new();
    let (log, make) = recorder();
    let a = registry.on(ClientEvent::Change, make("a"));
    registry.on(ClientEvent::Change, make("b"));
    registry.on(ClientEvent::Ready, make("c"));

    assert!(registry.off(a));
    assert_eq!(registry.emit(&EventPayload::Change(ChangeSet::new())), 1);
    assert_eq!(registry.emit(&EventPayload::Ready), 1);
    assert_eq!(*log.lock().unwrap(), vec!["b:change".to_string(), "c:ready".to_string()]);
}

#[test]
fn handler_may_unsubscribe_itself_during_delivery() {
    let registry = Arc::new(EventRegistry::new());
    let hits = Arc::new(Mutex::new(0));
    let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

    let id = {
        let inner = Arc::clone(&registry);
        let hits = Arc::clone(&hits);
        let slot = Arc::clone(&slot);
        registry.on(
            ClientEvent::Ready,
            Arc::new(move |_: &EventPayload| {
                *hits.lock().unwrap() += 1;
                if let Some(id) = *slot.lock().unwrap() {
                    inner.off(id);
                }
            }),
        )
    };
    *slot.lock().unwrap() = Some(id);

    registry.emit(&EventPayload::Ready);
    registry.emit(&EventPayload::Ready);
    assert_eq!(*hits.lock().unwrap(), 1);
}

#[test]
fn emit_changes_sends_aggregate_then_per_flag() {
    let registry = EventRegistry::new();
    let (log, make) = recorder();
    registry.on(ClientEvent::Change, make("all"));
    registry.on(ClientEvent::flag("a"), make("a"));
    registry.on(ClientEvent::flag("b"), make("b"));

    let mut changes = ChangeSet::new();
    changes.insert("b".into(), FlagChange { current: json!(1), previous: None });
    changes.insert("a".into(), FlagChange { current: json!(2), previous: None });

    assert_eq!(registry.emit_changes(&changes), 3);
    assert_eq!(*log.lock().unwrap(), vec!["all:change", "a:change:a", "b:change:b"]);
    assert_eq!(registry.emit_changes(&ChangeSet::new()), 0);
}
