//! Leveled console logger whose threshold comes from a feature flag.
//!
//! Six levels, `FATAL` (0) through `TRACE` (5). A message is emitted when its
//! level is at or below the current threshold, so `FATAL` always gets through.
//! Output goes to `tracing` under the `console` target, indented by the
//! current group depth. Every call reports whether it emitted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use flags::ConsoleLevel;
use tracing::Level;
use tracing_subscriber::filter::{LevelFilter, Targets};

use crate::client::SDK_TARGET;

/// `tracing` target for console output.
pub const CONSOLE_TARGET: &str = "console";

const INDENT: &str = "  ";

/// Subscriber filter: `max_level` for diagnostics, everything for the
/// console and SDK targets, which their own level flags already gate.
#[must_use]
pub fn subscriber_filter(max_level: Level) -> Targets {
    Targets::new()
        .with_default(max_level)
        .with_target(CONSOLE_TARGET, LevelFilter::TRACE)
        .with_target(SDK_TARGET, LevelFilter::TRACE)
}

#[derive(Debug)]
pub struct FlagLogger {
    level: AtomicU8,
    groups: Mutex<Vec<String>>,
    timers: Mutex<HashMap<String, Instant>>,
}

impl FlagLogger {
    #[must_use]
    pub fn new(level: ConsoleLevel) -> Self {
        Self { level: AtomicU8::new(level.as_u8()), groups: Mutex::default(), timers: Mutex::default() }
    }

    #[must_use]
    pub fn level(&self) -> ConsoleLevel {
        ConsoleLevel::try_from(self.level.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub fn set_level(&self, level: ConsoleLevel) {
        let previous = self.level.swap(level.as_u8(), Ordering::AcqRel);
        if previous != level.as_u8() {
            tracing::debug!(target: CONSOLE_TARGET, level = %level.describe(), "console level set");
        }
    }

    #[must_use]
    pub fn enabled(&self, level: ConsoleLevel) -> bool {
        self.level().allows(level)
    }

    pub fn fatal(&self, message: &str) -> bool {
        self.log(ConsoleLevel::Fatal, message)
    }

    pub fn error(&self, message: &str) -> bool {
        self.log(ConsoleLevel::Error, message)
    }

    pub fn warn(&self, message: &str) -> bool {
        self.log(ConsoleLevel::Warn, message)
    }

    pub fn info(&self, message: &str) -> bool {
        self.log(ConsoleLevel::Info, message)
    }

    pub fn debug(&self, message: &str) -> bool {
        self.log(ConsoleLevel::Debug, message)
    }

    pub fn trace(&self, message: &str) -> bool {
        self.log(ConsoleLevel::Trace, message)
    }

    /// Emit `message` at `level` if the threshold allows it.
    pub fn log(&self, level: ConsoleLevel, message: &str) -> bool {
        if !self.enabled(level) {
            return false;
        }
        let (depth, group) = {
            let groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
            (groups.len(), groups.last().cloned().unwrap_or_default())
        };
        let line = format!("{}[{}] {message}", INDENT.repeat(depth), level.label());
        match level {
            ConsoleLevel::Fatal | ConsoleLevel::Error => tracing::error!(target: CONSOLE_TARGET, group = %group, "{line}"),
            ConsoleLevel::Warn => tracing::warn!(target: CONSOLE_TARGET, group = %group, "{line}"),
            ConsoleLevel::Info => tracing::info!(target: CONSOLE_TARGET, group = %group, "{line}"),
            ConsoleLevel::Debug => tracing::debug!(target: CONSOLE_TARGET, group = %group, "{line}"),
            ConsoleLevel::Trace => tracing::trace!(target: CONSOLE_TARGET, group = %group, "{line}"),
        }
        true
    }

    /// Open a labelled group. Messages logged until [`Self::group_end`] are
    /// indented one step further. The header is logged at `INFO`.
    pub fn group(&self, label: &str) -> usize {
        self.log(ConsoleLevel::Info, label);
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        groups.push(label.to_owned());
        groups.len()
    }

    /// Close the innermost group, returning its label. No-op at depth 0.
    pub fn group_end(&self) -> Option<String> {
        self.groups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Start (or restart) the timer named `label`.
    pub fn time(&self, label: &str) {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(label.to_owned(), Instant::now());
    }

    /// Stop the timer named `label` and log its elapsed time at `INFO`.
    /// Returns `None` if no such timer was started.
    pub fn time_end(&self, label: &str) -> Option<Duration> {
        let started = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(label);
        let Some(started) = started else {
            self.warn(&format!("timer {label} does not exist"));
            return None;
        };
        let elapsed = started.elapsed();
        self.info(&format!("{label}: {:.3}ms", elapsed.as_secs_f64() * 1000.0));
        Some(elapsed)
    }
}

impl Default for FlagLogger {
    fn default() -> Self {
        Self::new(ConsoleLevel::default())
    }
}

#[cfg(test)]
#[path = "logger_test.rs"]
mod tests;
