use std::collections::HashMap;

use super::*;

fn required_env() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("NODE_ENV", "development"),
        ("LD_CLIENT_ID", "client-123"),
        ("APP_NAME", "logger-demo"),
        ("LD_SDK_LOG_FLAG_KEY", "sdk-log-level"),
        ("LD_CONSOLE_LOG_FLAG_KEY", "console-log-level"),
    ])
}

fn parse(env: &HashMap<&'static str, &'static str>) -> Result<AppConfig, ConfigError> {
    AppConfig::from_lookup(|key| env.get(key).map(|v| (*v).to_string()))
}

#[test]
fn from_lookup_applies_defaults() {
    let cfg = parse(&required_env()).unwrap();
    assert_eq!(cfg.environment, "development");
    assert_eq!(cfg.client_id, "client-123");
    assert_eq!(cfg.console_log_flag_key, "console-log-level");
    assert_eq!(cfg.sdk_log_flag_key, "sdk-log-level");
    assert_eq!(cfg.base_url, None);
    assert_eq!(cfg.init_timeout, Duration::from_millis(DEFAULT_INIT_TIMEOUT_MS));
    assert_eq!(cfg.request_timeout, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS));
    assert_eq!(cfg.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    assert!(cfg.is_development());
}

#[test]
fn from_lookup_parses_overrides() {
    let mut env = required_env();
    env.insert("LD_BASE_URL", "https://flags.example.test/");
    env.insert("LD_INIT_TIMEOUT_MS", "250");
    env.insert("LD_REQUEST_TIMEOUT_SECS", "3");
    env.insert("FLAGDEMO_DATA_DIR", "/tmp/flagdemo");

    let cfg = parse(&env).unwrap();
    assert_eq!(cfg.base_url.as_deref(), Some("https://flags.example.test"));
    assert_eq!(cfg.init_timeout, Duration::from_millis(250));
    assert_eq!(cfg.request_timeout, Duration::from_secs(3));
    assert_eq!(cfg.data_dir, PathBuf::from("/tmp/flagdemo"));
}

#[test]
fn from_lookup_reports_every_missing_var() {
    let mut env = required_env();
    env.remove("LD_CLIENT_ID");
    env.remove("LD_CONSOLE_LOG_FLAG_KEY");

    let err = parse(&env).unwrap_err();
    match &err {
        ConfigError::MissingVars(vars) => assert_eq!(vars, &vec!["LD_CLIENT_ID", "LD_CONSOLE_LOG_FLAG_KEY"]),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("LD_CLIENT_ID, LD_CONSOLE_LOG_FLAG_KEY"));
}

#[test]
fn from_lookup_treats_blank_as_missing() {
    let mut env = required_env();
    env.insert("APP_NAME", "   ");

    let err = parse(&env).unwrap_err();
    assert!(matches!(err, ConfigError::MissingVars(ref vars) if vars == &vec!["APP_NAME"]));
}

#[test]
fn from_lookup_rejects_bad_timeout() {
    let mut env = required_env();
    env.insert("LD_INIT_TIMEOUT_MS", "soon");

    let err = parse(&env).unwrap_err().to_string();
    assert!(err.contains("invalid LD_INIT_TIMEOUT_MS"));
}

#[test]
fn application_context_uses_name_and_environment() {
    let cfg = parse(&required_env()).unwrap();
    let app = cfg.application_context();
    assert_eq!(app.key, "logger-demo");
    assert_eq!(app.environment, "development");
}
