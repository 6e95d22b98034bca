use std::sync::atomic::AtomicUsize;

use flags::ApplicationContext;

use super::*;
use crate::client::{ClientOptions, MemoryFlagClient};
use crate::events::{EventRegistry, Handler};
use crate::storage::MemoryStore;

const CONSOLE: &str = "console-log-level";
const SDK: &str = "sdk-log-level";

fn keys() -> FlagKeys {
    FlagKeys { console: CONSOLE.into(), sdk: SDK.into() }
}

fn context() -> EvaluationContext {
    EvaluationContext::new(None, ApplicationContext { key: "logger-demo".into(), environment: "test".into() })
}

fn options() -> ClientOptions {
    ClientOptions { client_id: "client-123".into(), sdk_log_level: SdkLogLevel::Info, request_timeout: Duration::from_secs(1) }
}

fn store_with_level(level: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.set(SDK_LOG_LEVEL_KEY, level).unwrap();
    store
}

fn synchronizer(store: Arc<MemoryStore>) -> (Synchronizer, mpsc::UnboundedReceiver<RestartRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Synchronizer::new(keys(), store, tx, Duration::from_millis(100)), rx)
}

fn memory_client(console: Value, sdk: Value) -> Arc<MemoryFlagClient> {
    let client = MemoryFlagClient::new(&options()).with_flag(CONSOLE, console).with_flag(SDK, sdk);
    client.mark_ready();
    Arc::new(client)
}

// =============================================================================
// STUB CLIENT
// =============================================================================

/// Client whose readiness and evaluation outcome are fixed up front.
struct StubClient {
    ready: bool,
    fail_evaluations: bool,
    calls: AtomicUsize,
    events: EventRegistry,
}

impl StubClient {
    fn new(ready: bool, fail_evaluations: bool) -> Self {
        Self { ready, fail_evaluations, calls: AtomicUsize::new(0), events: EventRegistry::new() }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FlagClient for StubClient {
    async fn wait_for_initialization(&self, timeout: Duration) -> Result<(), FlagError> {
        if self.ready {
            Ok(())
        } else {
            tokio::time::sleep(timeout).await;
            Err(FlagError::InitTimeout { ms: crate::client::millis(timeout) })
        }
    }

    async fn variation_detail(
        &self,
        _key: &str,
        _context: &EvaluationContext,
        default: Value,
    ) -> Result<EvaluationDetail<Value>, FlagError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_evaluations {
            Err(FlagError::Request("connection reset".into()))
        } else {
            Ok(EvaluationDetail { value: default, variation_index: Some(0), reason: Reason::Fallthrough })
        }
    }

    async fn identify(&self, _context: &EvaluationContext) -> Result<(), FlagError> {
        Ok(())
    }

    fn on(&self, event: ClientEvent, handler: Handler) -> SubscriptionId {
        self.events.on(event, handler)
    }

    fn off(&self, id: SubscriptionId) {
        self.events.off(id);
    }

    fn sdk_log_level(&self) -> SdkLogLevel {
        SdkLogLevel::Info
    }

    async fn close(&self) {
        self.events.clear();
    }
}

// =============================================================================
// INITIALIZATION
// =============================================================================

#[tokio::test]
async fn initialize_seeds_cache_from_flags() {
    let (mut sync, mut rx) = synchronizer(store_with_level("info"));
    sync.initialize(memory_client(json!(4), json!("info")), &context()).await.unwrap();

    assert_eq!(sync.state(), SyncState::Ready);
    let cache = sync.cache();
    assert_eq!(cache.console.unwrap().value, ConsoleLevel::Debug);
    assert_eq!(cache.sdk.unwrap().value, SdkLogLevel::Info);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn no_ready_signal_within_timeout_fails_and_stops_remote_calls() {
    let (mut sync, _rx) = synchronizer(store_with_level("info"));
    let stub = Arc::new(StubClient::new(false, false));

    let err = sync.initialize(stub.clone(), &context()).await.unwrap_err();
    assert_eq!(err, FlagError::InitTimeout { ms: 100 });
    assert!(matches!(sync.state(), SyncState::Failed(_)));

    let detail = sync.evaluate(CONSOLE, json!(3), &context()).await;
    assert_eq!(detail.value, json!(3));
    assert_eq!(detail.reason, Reason::Error { error_kind: ErrorKind::ClientNotReady });
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn memory_client_never_ready_times_out() {
    let (mut sync, _rx) = synchronizer(store_with_level("info"));
    let client = Arc::new(MemoryFlagClient::new(&options()));
    assert!(sync.initialize(client, &context()).await.is_err());
    assert!(matches!(sync.state(), SyncState::Failed(_)));
}

#[tokio::test]
async fn evaluate_before_initialize_serves_default() {
    let (sync, _rx) = synchronizer(store_with_level("info"));
    assert_eq!(sync.state(), SyncState::Uninitialized);
    let detail = sync.evaluate(CONSOLE, json!(3), &context()).await;
    assert!(detail.is_fallback());
}

// =============================================================================
// EVALUATION
// =============================================================================

#[tokio::test]
async fn failing_remote_call_yields_default_console_level() {
    let (mut sync, _rx) = synchronizer(store_with_level("info"));
    let stub = Arc::new(StubClient::new(true, true));
    sync.initialize(stub.clone(), &context()).await.unwrap();

    let detail = sync.evaluate(CONSOLE, json!(3), &context()).await;
    assert_eq!(detail.value, json!(3));
    assert_eq!(detail.reason, Reason::Error { error_kind: ErrorKind::Exception });

    let level = sync.console_level(&context()).await;
    assert_eq!(level.value, ConsoleLevel::Info);
    assert!(stub.calls() >= 2);
}

#[tokio::test]
async fn out_of_domain_console_level_is_rejected() {
    let (mut sync, _rx) = synchronizer(store_with_level("info"));
    sync.initialize(memory_client(json!(9), json!("info")), &context()).await.unwrap();

    let level = sync.console_level(&context()).await;
    assert_eq!(level.value, ConsoleLevel::Info);
    assert_eq!(level.reason, Reason::Error { error_kind: ErrorKind::WrongType });
    assert_eq!(sync.cache().console.unwrap().value, ConsoleLevel::Info);
}

#[tokio::test]
async fn typed_sdk_level_reads_flag() {
    let (mut sync, _rx) = synchronizer(store_with_level("warn"));
    sync.initialize(memory_client(json!(3), json!("warn")), &context()).await.unwrap();
    let level = sync.sdk_level(&context()).await;
    assert_eq!(level.value, SdkLogLevel::Warn);
    assert_eq!(level.reason, Reason::Fallthrough);
}

#[tokio::test]
async fn out_of_domain_sdk_level_is_rejected_without_restart() {
    let (mut sync, mut rx) = synchronizer(store_with_level("info"));
    sync.initialize(memory_client(json!(3), json!("verbose")), &context()).await.unwrap();

    let level = sync.sdk_level(&context()).await;
    assert_eq!(level.value, SdkLogLevel::Info);
    assert_eq!(level.reason, Reason::Error { error_kind: ErrorKind::WrongType });
    assert!(sync.cache().sdk.is_none());
    assert!(rx.try_recv().is_err());
}

// =============================================================================
// SDK LEVEL RESTART
// =============================================================================

#[tokio::test]
async fn equal_sdk_level_neither_persists_nor_restarts() {
    let (mut sync, mut rx) = synchronizer(store_with_level("debug"));
    sync.initialize(memory_client(json!(3), json!("debug")), &context()).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[test]
fn applying_the_stored_level_is_a_no_op() {
    let store = CountingStore::with_level("warn");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let restart = RestartSignal { tx, sent: Arc::new(AtomicBool::new(false)) };
    let cache = Mutex::new(FlagCache::default());

    assert!(!apply_sdk_level(SDK, &json!("warn"), None, &cache, &store, &restart));
    assert_eq!(store.writes(), 0);
    assert!(rx.try_recv().is_err());
    assert_eq!(cache.lock().unwrap().sdk.as_ref().unwrap().value, SdkLogLevel::Warn);

    assert!(apply_sdk_level(SDK, &json!("error"), None, &cache, &store, &restart));
    assert_eq!(store.writes(), 1);
    assert!(rx.try_recv().is_ok());
}

#[test]
fn failed_persist_does_not_restart_or_skew_later_comparisons() {
    let dir = std::env::temp_dir().join(format!("flagdemo-sync-failed-persist-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let store = crate::storage::FileStore::in_dir(&dir).unwrap();
    store.set(SDK_LOG_LEVEL_KEY, "info").unwrap();
    let tmp = store.path().with_extension("json.tmp");
    std::fs::create_dir_all(&tmp).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let restart = RestartSignal { tx, sent: Arc::new(AtomicBool::new(false)) };
    let cache = Mutex::new(FlagCache::default());

    assert!(!apply_sdk_level(SDK, &json!("debug"), None, &cache, &store, &restart));
    assert!(!apply_sdk_level(SDK, &json!("info"), None, &cache, &store, &restart));
    assert!(rx.try_recv().is_err());

    std::fs::remove_dir_all(&tmp).unwrap();
    assert!(apply_sdk_level(SDK, &json!("debug"), None, &cache, &store, &restart));
    assert_eq!(
        rx.try_recv().unwrap(),
        RestartRequest { sdk_log_level: SdkLogLevel::Debug, previous: Some(SdkLogLevel::Info) }
    );

    let _ = std::fs::remove_dir_all(&dir);
}

/// Memory store that counts writes.
struct CountingStore {
    inner: MemoryStore,
    writes: AtomicUsize,
}

impl CountingStore {
    fn with_level(level: &str) -> Self {
        let inner = MemoryStore::new();
        inner.set(SDK_LOG_LEVEL_KEY, level).unwrap();
        Self { inner, writes: AtomicUsize::new(0) }
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl KeyValueStore for CountingStore {
    fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), crate::storage::StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), crate::storage::StorageError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(key)
    }
}

#[tokio::test]
async fn different_sdk_level_persists_and_restarts_once() {
    let store = store_with_level("info");
    let (mut sync, mut rx) = synchronizer(Arc::clone(&store));
    let client = memory_client(json!(3), json!("info"));
    sync.initialize(client.clone(), &context()).await.unwrap();
    assert!(rx.try_recv().is_err());

    client.set_flag(SDK, json!("debug"));
    assert_eq!(store.get(SDK_LOG_LEVEL_KEY).as_deref(), Some("debug"));
    assert_eq!(
        rx.try_recv().unwrap(),
        RestartRequest { sdk_log_level: SdkLogLevel::Debug, previous: Some(SdkLogLevel::Info) }
    );

    client.set_flag(SDK, json!("warn"));
    assert_eq!(store.get(SDK_LOG_LEVEL_KEY).as_deref(), Some("warn"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn first_observed_sdk_level_restarts_when_nothing_stored() {
    let store = Arc::new(MemoryStore::new());
    let (mut sync, mut rx) = synchronizer(Arc::clone(&store));
    sync.initialize(memory_client(json!(3), json!("warn")), &context()).await.unwrap();

    assert_eq!(store.get(SDK_LOG_LEVEL_KEY).as_deref(), Some("warn"));
    assert_eq!(rx.try_recv().unwrap(), RestartRequest { sdk_log_level: SdkLogLevel::Warn, previous: None });
}

#[tokio::test]
async fn invalid_sdk_level_is_not_persisted() {
    let store = store_with_level("info");
    let (mut sync, mut rx) = synchronizer(Arc::clone(&store));
    let client = memory_client(json!(3), json!("info"));
    sync.initialize(client.clone(), &context()).await.unwrap();

    client.set_flag(SDK, json!("verbose"));
    assert_eq!(store.get(SDK_LOG_LEVEL_KEY).as_deref(), Some("info"));
    assert_eq!(sync.cache().sdk.unwrap().value, SdkLogLevel::Info);
    assert!(rx.try_recv().is_err());
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

#[tokio::test]
async fn two_subscribers_fire_and_survive_each_others_removal() {
    let (mut sync, _rx) = synchronizer(store_with_level("info"));
    let client = memory_client(json!(3), json!("info"));
    sync.initialize(client.clone(), &context()).await.unwrap();

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&first);
    let id = sync
        .on_change(CONSOLE, move |change: &FlagChange| sink.lock().unwrap().push(change.current.clone()))
        .unwrap();
    let sink = Arc::clone(&second);
    sync.on_change(CONSOLE, move |change: &FlagChange| sink.lock().unwrap().push(change.current.clone()))
        .unwrap();

    client.set_flag(CONSOLE, json!(4));
    sync.off(id);
    sync.off(id);
    client.set_flag(CONSOLE, json!(5));

    assert_eq!(*first.lock().unwrap(), vec![json!(4)]);
    assert_eq!(*second.lock().unwrap(), vec![json!(4), json!(5)]);
    assert_eq!(sync.cache().console.unwrap().value, ConsoleLevel::Trace);
}

#[tokio::test]
async fn any_change_handler_sees_batch() {
    let (mut sync, _rx) = synchronizer(store_with_level("info"));
    let client = memory_client(json!(3), json!("info"));
    sync.initialize(client.clone(), &context()).await.unwrap();

    let keys = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&keys);
    sync.on_any_change(move |changes: &ChangeSet| sink.lock().unwrap().extend(changes.keys().cloned()))
        .unwrap();

    client.set_flag(CONSOLE, json!(1));
    assert_eq!(*keys.lock().unwrap(), vec![CONSOLE.to_string()]);
}

#[test]
fn subscribing_without_client_is_not_ready() {
    let (sync, _rx) = synchronizer(store_with_level("info"));
    let err = sync.on_change(CONSOLE, |_: &FlagChange| {}).unwrap_err();
    assert_eq!(err, FlagError::NotReady);
}

#[tokio::test]
async fn shutdown_removes_every_handler() {
    let store = store_with_level("info");
    let (mut sync, mut rx) = synchronizer(Arc::clone(&store));
    let client = memory_client(json!(3), json!("info"));
    sync.initialize(client.clone(), &context()).await.unwrap();
    sync.on_any_change(|_: &ChangeSet| {}).unwrap();

    sync.shutdown();
    client.set_flag(SDK, json!("debug"));
    client.set_flag(CONSOLE, json!(0));

    assert_eq!(store.get(SDK_LOG_LEVEL_KEY).as_deref(), Some("info"));
    assert!(rx.try_recv().is_err());
    assert_eq!(sync.cache().console.unwrap().value, ConsoleLevel::Info);
}

#[tokio::test]
async fn unsubscribe_after_client_close_is_safe() {
    let (mut sync, _rx) = synchronizer(store_with_level("info"));
    let client = memory_client(json!(3), json!("info"));
    sync.initialize(client.clone(), &context()).await.unwrap();
    let id = sync.on_any_change(|_: &ChangeSet| {}).unwrap();

    client.close().await;
    sync.off(id);
    sync.shutdown();
}

#[tokio::test]
async fn snapshot_renders_levels() {
    let (mut sync, _rx) = synchronizer(store_with_level("debug"));
    sync.initialize(memory_client(json!(3), json!("debug")), &context()).await.unwrap();
    assert_eq!(
        sync.snapshot(),
        vec![(CONSOLE.to_string(), "3 (INFO)".to_string()), (SDK.to_string(), "debug".to_string())]
    );
}
