//! Feature-flag driven logger demo.
//!
//! A terminal front end reads two level flags from a flag service: a numeric
//! console level gating the app's own logger, and a string SDK level fixed
//! into the flag client at construction. A new SDK level is persisted and the
//! client rebuilt.

pub mod app;
pub mod auth;
pub mod client;
pub mod config;
pub mod events;
pub mod logger;
pub mod shell;
pub mod storage;
pub mod sync;
