//! Shared flag model for the logger demo.
//!
//! This crate owns the value types that cross the boundary between the app
//! and the remote flag service: severity levels, evaluation contexts,
//! evaluation details with their reasons, and change payloads. It does no
//! I/O; flag values themselves stay as `serde_json::Value` so the remote
//! service decides their shape and the app validates on read.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error returned when a flag value falls outside its enumerated domain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LevelError {
    /// The console level was not an integer in `0..=5`.
    #[error("invalid console log level: {0} (expected integer 0-5)")]
    InvalidConsoleLevel(String),
    /// The SDK level was not one of `error`, `warn`, `info`, `debug`.
    #[error("invalid SDK log level: {0} (expected one of error, warn, info, debug)")]
    InvalidSdkLevel(String),
}

// =============================================================================
// CONSOLE LEVEL
// =============================================================================

/// Verbosity of the app's own logger, served by the numeric console flag.
///
/// Lower is more severe. A message at level `L` is visible when `L` is at or
/// below the current level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ConsoleLevel {
    Fatal = 0,
    Error = 1,
    Warn = 2,
    #[default]
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl ConsoleLevel {
    /// Every level, most severe first.
    pub const ALL: [Self; 6] = [Self::Fatal, Self::Error, Self::Warn, Self::Info, Self::Debug, Self::Trace];

    /// Numeric flag value for this level.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Upper-case display label (`FATAL` .. `TRACE`).
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Render as `"<n> (<LABEL>)"`, the form used in flag dumps.
    #[must_use]
    pub fn describe(self) -> String {
        format!("{} ({})", self.as_u8(), self.label())
    }

    /// Whether a message at `message` level passes this threshold.
    #[must_use]
    pub fn allows(self, message: Self) -> bool {
        message <= self
    }

    /// Validate a raw flag value.
    ///
    /// # Errors
    ///
    /// Returns [`LevelError::InvalidConsoleLevel`] for anything that is not
    /// an integer in `0..=5`. Floats with a fractional part are rejected.
    pub fn from_value(value: &Value) -> Result<Self, LevelError> {
        value
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .and_then(|n| Self::try_from(n).ok())
            .ok_or_else(|| LevelError::InvalidConsoleLevel(value.to_string()))
    }
}

impl TryFrom<u8> for ConsoleLevel {
    type Error = LevelError;

    fn try_from(value: u8) -> Result<Self, LevelError> {
        match value {
            0 => Ok(Self::Fatal),
            1 => Ok(Self::Error),
            2 => Ok(Self::Warn),
            3 => Ok(Self::Info),
            4 => Ok(Self::Debug),
            5 => Ok(Self::Trace),
            other => Err(LevelError::InvalidConsoleLevel(other.to_string())),
        }
    }
}

impl From<ConsoleLevel> for u8 {
    fn from(level: ConsoleLevel) -> Self {
        level.as_u8()
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// SDK LEVEL
// =============================================================================

/// Construction-time verbosity of the flag client's own diagnostics.
///
/// Ordered from least to most verbose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdkLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl SdkLogLevel {
    /// Every accepted level, least verbose first.
    pub const ALL: [Self; 4] = [Self::Error, Self::Warn, Self::Info, Self::Debug];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }

    /// Whether the client should emit a diagnostic at `message` level.
    #[must_use]
    pub fn allows(self, message: Self) -> bool {
        message <= self
    }

    /// Validate a raw flag value.
    ///
    /// # Errors
    ///
    /// Returns [`LevelError::InvalidSdkLevel`] unless the value is one of
    /// the four lowercase level strings.
    pub fn from_value(value: &Value) -> Result<Self, LevelError> {
        match value.as_str() {
            Some(raw) => raw.parse(),
            None => Err(LevelError::InvalidSdkLevel(value.to_string())),
        }
    }
}

impl FromStr for SdkLogLevel {
    type Err = LevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Self::Error),
            "warn" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            other => Err(LevelError::InvalidSdkLevel(other.to_owned())),
        }
    }
}

impl fmt::Display for SdkLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CONTEXTS
// =============================================================================

/// Key used for the user context when nobody is logged in.
pub const ANONYMOUS_KEY: &str = "anonymous";

/// The actor being evaluated: a logged-in user or the anonymous visitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename = "user")]
pub struct UserContext {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub anonymous: bool,
}

impl UserContext {
    /// Named user as created by the login screen.
    #[must_use]
    pub fn named(username: &str) -> Self {
        Self { key: username.to_owned(), name: Some(username.to_owned()), email: None, anonymous: false }
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self { key: ANONYMOUS_KEY.to_owned(), name: None, email: None, anonymous: true }
    }
}

/// The application instance doing the evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename = "application")]
pub struct ApplicationContext {
    pub key: String,
    pub environment: String,
}

/// Multi-kind context sent to the flag service on every evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename = "multi")]
pub struct EvaluationContext {
    pub user: UserContext,
    pub application: ApplicationContext,
}

impl EvaluationContext {
    /// Build the context for `user`, or for the anonymous visitor when `None`.
    #[must_use]
    pub fn new(user: Option<&UserContext>, application: ApplicationContext) -> Self {
        let user = user.cloned().unwrap_or_else(UserContext::anonymous);
        Self { user, application }
    }
}

// =============================================================================
// EVALUATION DETAIL
// =============================================================================

/// Why an evaluation failed, as reported in an `ERROR` reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ClientNotReady,
    FlagNotFound,
    WrongType,
    MalformedFlag,
    UserNotSpecified,
    Exception,
}

/// Why a particular variation was served.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Off,
    Fallthrough,
    TargetMatch,
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    #[serde(rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

impl Reason {
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("OFF"),
            Self::Fallthrough => f.write_str("FALLTHROUGH"),
            Self::TargetMatch => f.write_str("TARGET_MATCH"),
            Self::RuleMatch { rule_index, .. } => write!(f, "RULE_MATCH[{rule_index}]"),
            Self::PrerequisiteFailed { prerequisite_key } => write!(f, "PREREQUISITE_FAILED({prerequisite_key})"),
            Self::Error { error_kind } => {
                let kind = serde_json::to_value(error_kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                write!(f, "ERROR({kind})")
            }
        }
    }
}

/// A served value together with the reason it was chosen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail<T> {
    pub value: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl<T> EvaluationDetail<T> {
    /// The caller's default, served because evaluation failed.
    #[must_use]
    pub fn fallback(default: T, error_kind: ErrorKind) -> Self {
        Self { value: default, variation_index: None, reason: Reason::Error { error_kind } }
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.reason.is_error()
    }

    /// Map the value, keeping variation index and reason.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> EvaluationDetail<U> {
        EvaluationDetail { value: f(self.value), variation_index: self.variation_index, reason: self.reason }
    }
}

// =============================================================================
// CHANGES
// =============================================================================

/// One flag's transition as pushed by the remote service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlagChange {
    pub current: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
}

/// Every flag that changed in one update, keyed by flag key.
pub type ChangeSet = BTreeMap<String, FlagChange>;

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
