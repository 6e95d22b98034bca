use flags::ApplicationContext;
use serde_json::json;

use super::*;

fn detail(value: Value) -> EvaluationDetail<Value> {
    EvaluationDetail { value, variation_index: None, reason: Reason::Fallthrough }
}

fn options() -> ClientOptions {
    ClientOptions {
        client_id: "client-123".into(),
        sdk_log_level: SdkLogLevel::Error,
        request_timeout: Duration::from_secs(1),
    }
}

fn context() -> EvaluationContext {
    EvaluationContext::new(None, ApplicationContext { key: "logger-demo".into(), environment: "test".into() })
}

// =============================================================================
// parse_flags
// =============================================================================

#[test]
fn parse_flags_reads_values_variations_and_reasons() {
    let body = r#"{
        "console-log-level": {"value": 4, "variation": 4, "version": 12,
                              "reason": {"kind": "RULE_MATCH", "ruleIndex": 0, "ruleId": "abc"}},
        "sdk-log-level": {"value": "warn", "variation": 1, "version": 3, "trackEvents": false}
    }"#;

    let flags = parse_flags(body).unwrap();
    let console = &flags["console-log-level"];
    assert_eq!(console.value, json!(4));
    assert_eq!(console.variation_index, Some(4));
    assert_eq!(console.reason, Reason::RuleMatch { rule_index: 0, rule_id: Some("abc".into()) });

    let sdk = &flags["sdk-log-level"];
    assert_eq!(sdk.value, json!("warn"));
    assert_eq!(sdk.reason, Reason::Fallthrough);
}

#[test]
fn parse_flags_rejects_body_that_is_not_an_object() {
    assert!(matches!(parse_flags("[1, 2]"), Err(FlagError::Parse(_))));
    assert!(matches!(parse_flags("not json"), Err(FlagError::Parse(_))));
}

#[test]
fn parse_flags_skips_entry_without_value() {
    let body = r#"{"a": {"variation": 1}, "b": 7, "console-log-level": {"value": 2}}"#;
    let flags = parse_flags(body).unwrap();
    assert_eq!(flags.len(), 1);
    assert_eq!(flags["console-log-level"].value, json!(2));
}

#[test]
fn parse_flags_keeps_siblings_of_user_not_specified_error() {
    let body = r#"{
        "anonymous-only": {"value": false, "reason": {"kind": "ERROR", "errorKind": "USER_NOT_SPECIFIED"}},
        "console-log-level": {"value": 5, "variation": 5, "reason": {"kind": "FALLTHROUGH"}}
    }"#;

    let flags = parse_flags(body).unwrap();
    assert_eq!(flags["console-log-level"].value, json!(5));
    assert_eq!(
        flags["anonymous-only"].reason,
        Reason::Error { error_kind: ErrorKind::UserNotSpecified }
    );
}

#[test]
fn parse_flags_records_unrecognized_reason_as_fallthrough() {
    let body = r#"{
        "beta": {"value": true, "reason": {"kind": "BIG_SEGMENTS_STALE"}},
        "gamma": {"value": 1, "reason": {"kind": "ERROR", "errorKind": "SOMETHING_NEW"}},
        "sdk-log-level": {"value": "debug", "reason": {"kind": "OFF"}}
    }"#;

    let flags = parse_flags(body).unwrap();
    assert_eq!(flags.len(), 3);
    assert_eq!(flags["beta"].value, json!(true));
    assert_eq!(flags["beta"].reason, Reason::Fallthrough);
    assert_eq!(flags["gamma"].reason, Reason::Fallthrough);
    assert_eq!(flags["sdk-log-level"].reason, Reason::Off);
}

#[test]
fn parse_flags_accepts_empty_object() {
    assert!(parse_flags("{}").unwrap().is_empty());
}

// =============================================================================
// diff_flags
// =============================================================================

#[test]
fn diff_reports_changed_added_and_removed() {
    let old: FlagMap = [
        ("same".to_string(), detail(json!(1))),
        ("changed".to_string(), detail(json!("info"))),
        ("gone".to_string(), detail(json!(true))),
    ]
    .into_iter()
    .collect();
    let new: FlagMap = [
        ("same".to_string(), detail(json!(1))),
        ("changed".to_string(), detail(json!("debug"))),
        ("added".to_string(), detail(json!(5))),
    ]
    .into_iter()
    .collect();

    let changes = diff_flags(&old, &new);
    assert_eq!(changes.len(), 3);
    assert_eq!(changes["changed"], FlagChange { current: json!("debug"), previous: Some(json!("info")) });
    assert_eq!(changes["added"], FlagChange { current: json!(5), previous: None });
    assert_eq!(changes["gone"], FlagChange { current: Value::Null, previous: Some(json!(true)) });
    assert!(!changes.contains_key("same"));
}

#[test]
fn diff_ignores_reason_only_changes() {
    let old: FlagMap = [("k".to_string(), detail(json!(2)))].into_iter().collect();
    let mut new = old.clone();
    new.get_mut("k").unwrap().reason = Reason::TargetMatch;
    assert!(diff_flags(&old, &new).is_empty());
}

// =============================================================================
// client behaviour without a server
// =============================================================================

#[test]
fn evaluation_url_strips_trailing_slash() {
    assert_eq!(
        evaluation_url("https://flags.example.test/", "abc"),
        "https://flags.example.test/sdk/evalx/abc/context?withReasons=true"
    );
}

#[tokio::test]
async fn unreachable_service_fails_initialization() {
    let client = HttpFlagClient::new("http://127.0.0.1:9", &options(), context()).unwrap();
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, FlagError::Request(_)));

    let wait = client.wait_for_initialization(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(wait, FlagError::InitFailed(_)));
}

#[tokio::test]
async fn refresh_before_start_is_not_ready() {
    let client = HttpFlagClient::new("http://127.0.0.1:9", &options(), context()).unwrap();
    assert_eq!(client.refresh().await.unwrap_err(), FlagError::NotReady);
}

#[tokio::test]
async fn evaluation_before_start_serves_default() {
    let client = HttpFlagClient::new("http://127.0.0.1:9", &options(), context()).unwrap();
    let detail = client.variation_detail("console-log-level", &context(), json!(3)).await.unwrap();
    assert_eq!(detail.value, json!(3));
    assert_eq!(detail.reason, Reason::Error { error_kind: ErrorKind::ClientNotReady });
}
