//! Composition root and terminal front end.
//!
//! DESIGN
//! ======
//! [`AppContext`] carries config, stores, auth and the logger; it is built
//! once in `main` and handed to [`App`]. There are no globals.
//!
//! A [`FlagSession`] is one generation of flag client plus its
//! synchronizer. When the synchronizer asks for a restart, the session is
//! shut down and a new one is built with the SDK level now in local
//! storage. Auth state, the session store and the offline flag table
//! outlive sessions.
//!
//! LIFECYCLE
//! =========
//! `run` reads lines from any async reader and `select!`s them against the
//! restart channel. Restarts win when both are ready, so a command that
//! triggers one is followed by the restart before the next line.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use flags::{ChangeSet, ConsoleLevel, EvaluationContext, SdkLogLevel};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::auth::AuthState;
use crate::client::{ClientOptions, FlagClient, FlagError, HttpFlagClient, MemoryFlagClient};
use crate::config::{AppConfig, ConfigError};
use crate::logger::FlagLogger;
use crate::shell::{Command, HELP};
use crate::storage::{KeyValueStore, StorageError, stored_sdk_log_level};
use crate::sync::{FlagKeys, RestartRequest, SyncState, Synchronizer};

const LOADING: &str = "Loading feature flags...";
const DEMO_TIMER: &str = "flag-evaluation";
const DEMO_GROUP: &str = "Flag Demo Evaluation";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Flag(#[from] FlagError),
    #[error("terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Everything that outlives a flag client.
pub struct AppContext {
    pub config: AppConfig,
    /// Survives restarts and process exits.
    pub local: Arc<dyn KeyValueStore>,
    /// Lives for this process only.
    pub session: Arc<dyn KeyValueStore>,
    pub auth: AuthState,
    pub logger: Arc<FlagLogger>,
    /// Serve flags in-process even when a base URL is configured.
    pub offline: bool,
}

impl AppContext {
    #[must_use]
    pub fn new(
        config: AppConfig,
        local: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        offline: bool,
    ) -> Self {
        let auth = AuthState::load(Arc::clone(&local), Arc::clone(&session));
        let offline = offline || config.base_url.is_none();
        Self { config, local, session, auth, logger: Arc::new(FlagLogger::default()), offline }
    }

    fn flag_keys(&self) -> FlagKeys {
        FlagKeys { console: self.config.console_log_flag_key.clone(), sdk: self.config.sdk_log_flag_key.clone() }
    }

    fn evaluation_context(&self) -> EvaluationContext {
        self.auth.context(self.config.application_context())
    }
}

// =============================================================================
// SESSION
// =============================================================================

enum Backend {
    Offline(Arc<MemoryFlagClient>),
    Remote(Arc<HttpFlagClient>),
}

impl Backend {
    fn client(&self) -> Arc<dyn FlagClient> {
        match self {
            Self::Offline(client) => Arc::clone(client) as Arc<dyn FlagClient>,
            Self::Remote(client) => Arc::clone(client) as Arc<dyn FlagClient>,
        }
    }
}

/// One flag client and the synchronizer attached to it.
struct FlagSession {
    backend: Backend,
    sync: Synchronizer,
}

impl FlagSession {
    fn is_ready(&self) -> bool {
        self.sync.state() == SyncState::Ready
    }
}

// =============================================================================
// APP
// =============================================================================

pub struct App<W: Write> {
    ctx: AppContext,
    out: W,
    restart_tx: mpsc::UnboundedSender<RestartRequest>,
    restart_rx: mpsc::UnboundedReceiver<RestartRequest>,
    session: Option<FlagSession>,
    /// Lines produced by change handlers, written after the current command.
    notices: Arc<Mutex<Vec<String>>>,
    /// Offline flag table, carried across restarts.
    offline_flags: BTreeMap<String, Value>,
    demo_count: u64,
    restarts: usize,
}

impl<W: Write> App<W> {
    pub fn new(ctx: AppContext, out: W) -> Self {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let stored = stored_sdk_log_level(ctx.local.as_ref());
        let offline_flags = BTreeMap::from([
            (ctx.config.console_log_flag_key.clone(), json!(ConsoleLevel::default().as_u8())),
            (ctx.config.sdk_log_flag_key.clone(), json!(stored.as_str())),
        ]);
        Self {
            ctx,
            out,
            restart_tx,
            restart_rx,
            session: None,
            notices: Arc::new(Mutex::new(Vec::new())),
            offline_flags,
            demo_count: 0,
            restarts: 0,
        }
    }

    /// Build the first flag session and draw the opening screen.
    ///
    /// # Errors
    ///
    /// Fails on terminal I/O or if the HTTP client cannot be constructed.
    /// A flag client that never becomes ready is not an error here.
    pub async fn start(&mut self) -> Result<(), AppError> {
        info!(
            environment = %self.ctx.config.environment,
            app = %self.ctx.config.app_name,
            offline = self.ctx.offline,
            "starting"
        );
        self.start_session().await?;
        self.render().await
    }

    /// Drive the app from `input` until it ends or `quit` is entered.
    /// Returns the output sink.
    ///
    /// # Errors
    ///
    /// Fails on terminal I/O or a client rebuild failure.
    pub async fn run<R>(mut self, input: R) -> Result<W, AppError>
    where
        R: AsyncBufRead + Unpin,
    {
        if self.session.is_none() {
            self.start().await?;
        }
        let (_, closed) = mpsc::unbounded_channel();
        let mut restart_rx = std::mem::replace(&mut self.restart_rx, closed);
        let mut lines = input.lines();

        loop {
            self.flush_notices()?;
            write!(self.out, "> ")?;
            self.out.flush()?;

            tokio::select! {
                biased;
                Some(request) = restart_rx.recv() => {
                    writeln!(self.out)?;
                    self.restart(request).await?;
                }
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if !self.handle_line(&line).await? {
                        break;
                    }
                }
            }
        }

        self.stop_session().await;
        writeln!(self.out, "bye")?;
        Ok(self.out)
    }

    /// Process one input line. Returns `false` when the user asked to quit.
    ///
    /// # Errors
    ///
    /// Fails on terminal I/O or storage errors.
    pub async fn handle_line(&mut self, line: &str) -> Result<bool, AppError> {
        let keep_going = match Command::parse(line) {
            Ok(None) => true,
            Ok(Some(command)) => self.handle(command).await?,
            Err(e) => {
                writeln!(self.out, "{e}")?;
                true
            }
        };
        self.flush_notices()?;
        Ok(keep_going)
    }

    /// Apply a restart requested since the last call, if any.
    ///
    /// # Errors
    ///
    /// Same as [`App::run`].
    pub async fn apply_pending_restart(&mut self) -> Result<bool, AppError> {
        match self.restart_rx.try_recv() {
            Ok(request) => {
                self.restart(request).await?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    #[must_use]
    pub fn restarts(&self) -> usize {
        self.restarts
    }

    #[must_use]
    pub fn sync_state(&self) -> SyncState {
        self.session
            .as_ref()
            .map_or(SyncState::Uninitialized, |s| s.sync.state())
    }

    /// Level the current client was built with.
    #[must_use]
    pub fn client_sdk_level(&self) -> Option<SdkLogLevel> {
        self.session.as_ref().map(|s| s.backend.client().sdk_log_level())
    }

    #[must_use]
    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    #[must_use]
    pub fn output(&self) -> &W {
        &self.out
    }

    // -------------------------------------------------------------------------
    // sessions
    // -------------------------------------------------------------------------

    async fn start_session(&mut self) -> Result<(), AppError> {
        let level = stored_sdk_log_level(self.ctx.local.as_ref());
        let options = ClientOptions::from_config(&self.ctx.config, level);
        let context = self.ctx.evaluation_context();

        let backend = match &self.ctx.config.base_url {
            Some(base_url) if !self.ctx.offline => {
                let client = Arc::new(HttpFlagClient::new(base_url, &options, context.clone())?);
                let starter = Arc::clone(&client);
                tokio::spawn(async move {
                    if let Err(e) = starter.start().await {
                        warn!(error = %e, code = e.error_code(), "flag client start failed");
                    }
                });
                Backend::Remote(client)
            }
            _ => {
                let client = MemoryFlagClient::new(&options).with_flags(self.offline_flags.clone());
                client.identify(&context).await?;
                client.mark_ready();
                Backend::Offline(Arc::new(client))
            }
        };

        let mut sync = Synchronizer::new(
            self.ctx.flag_keys(),
            Arc::clone(&self.ctx.local),
            self.restart_tx.clone(),
            self.ctx.config.init_timeout,
        );
        info!(sdk_log_level = %level, "flag client created");

        match sync.initialize(backend.client(), &context).await {
            Ok(()) => self.attach(&sync),
            Err(e) => writeln!(self.out, "Feature flags unavailable: {e}")?,
        }
        self.session = Some(FlagSession { backend, sync });
        Ok(())
    }

    /// Wire the logger and change notices to a ready synchronizer.
    fn attach(&self, sync: &Synchronizer) {
        if let Some(console) = sync.cache().console {
            self.ctx.logger.set_level(console.value);
        }

        let logger = Arc::clone(&self.ctx.logger);
        let console_key = sync.keys().console.clone();
        if let Err(e) = sync.on_change(&console_key, move |change| {
            if let Ok(level) = ConsoleLevel::from_value(&change.current) {
                logger.set_level(level);
            }
        }) {
            warn!(error = %e, "could not follow console level");
        }

        let notices = Arc::clone(&self.notices);
        if let Err(e) = sync.on_any_change(move |changes: &ChangeSet| {
            let lines = describe_changes(&console_key, changes);
            notices.lock().unwrap_or_else(PoisonError::into_inner).extend(lines);
        }) {
            warn!(error = %e, "could not follow flag changes");
        }
    }

    async fn stop_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.sync.shutdown();
        if let Backend::Offline(client) = &session.backend {
            self.offline_flags = client.flags();
        }
        session.backend.client().close().await;
    }

    async fn restart(&mut self, request: RestartRequest) -> Result<(), AppError> {
        let previous = request.previous.map_or_else(|| "unset".to_owned(), |level| level.to_string());
        writeln!(
            self.out,
            "SDK log level changed from {previous} to {}; restarting flag client",
            request.sdk_log_level
        )?;
        self.stop_session().await;
        self.restarts += 1;
        self.start_session().await?;
        self.render().await
    }

    fn is_ready(&self) -> bool {
        self.session.as_ref().is_some_and(FlagSession::is_ready)
    }

    // -------------------------------------------------------------------------
    // commands
    // -------------------------------------------------------------------------

    async fn handle(&mut self, command: Command) -> Result<bool, AppError> {
        match command {
            Command::Quit => return Ok(false),
            Command::Status => self.status()?,
            _ if !self.is_ready() => writeln!(self.out, "{LOADING}")?,
            Command::Help => writeln!(self.out, "{HELP}")?,
            Command::Login(username) => self.login(&username).await?,
            Command::Logout(message) => self.logout(message.as_deref()).await?,
            Command::Flags => self.render().await?,
            Command::Demo => self.demo().await?,
            Command::Set { key, value } => self.set_flag(&key, value)?,
            Command::Refresh => self.refresh().await?,
        }
        Ok(true)
    }

    async fn login(&mut self, username: &str) -> Result<(), AppError> {
        if !self.ctx.auth.login(username)? {
            writeln!(self.out, "Please enter a username.")?;
            return Ok(());
        }
        self.identify().await;
        self.render().await
    }

    async fn logout(&mut self, message: Option<&str>) -> Result<(), AppError> {
        self.ctx.auth.logout(message)?;
        self.identify().await;
        self.render().await
    }

    async fn identify(&self) {
        let Some(session) = &self.session else {
            return;
        };
        let context = self.ctx.evaluation_context();
        if let Err(e) = session.backend.client().identify(&context).await {
            warn!(error = %e, user = %context.user.key, "identify failed");
        }
    }

    /// Evaluate both level flags and exercise every logger level.
    async fn demo(&mut self) -> Result<(), AppError> {
        self.demo_count += 1;
        let count = self.demo_count;
        let Some(session) = &self.session else {
            return Ok(());
        };
        let logger = Arc::clone(&self.ctx.logger);
        let context = self.ctx.evaluation_context();

        logger.time(DEMO_TIMER);
        let console = session.sync.console_level(&context).await;
        let sdk = session.sync.sdk_level(&context).await;
        logger.info(&format!(
            "Flag evaluation results: {}={} ({}), {}={} ({})",
            session.sync.keys().console,
            console.value.describe(),
            console.reason,
            session.sync.keys().sdk,
            sdk.value,
            sdk.reason,
        ));

        logger.group(DEMO_GROUP);
        let emitted = [
            logger.fatal("This is a FATAL message"),
            logger.error("This is an ERROR message"),
            logger.warn("This is a WARN message"),
            logger.info("This is an INFO message"),
            logger.debug("This is a DEBUG message"),
            logger.trace("This is a TRACE message"),
        ]
        .into_iter()
        .filter(|emitted| *emitted)
        .count();
        logger.group_end();
        let elapsed = logger.time_end(DEMO_TIMER).unwrap_or_default();
        logger.info(&format!("Demo counter incremented to {count}"));

        writeln!(
            self.out,
            "Demo run #{count}: console level {}, {emitted} of 6 test messages emitted in {:.1}ms",
            console.value.describe(),
            elapsed.as_secs_f64() * 1000.0,
        )?;
        Ok(())
    }

    fn set_flag(&mut self, key: &str, value: Value) -> Result<(), AppError> {
        let Some(FlagSession { backend: Backend::Offline(client), .. }) = &self.session else {
            writeln!(self.out, "`set` only works against the offline flag service")?;
            return Ok(());
        };
        if client.set_flag(key, value) {
            self.offline_flags = client.flags();
        } else {
            writeln!(self.out, "{key} unchanged")?;
        }
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), AppError> {
        let outcome = match &self.session {
            Some(FlagSession { backend: Backend::Remote(client), .. }) => client.refresh().await,
            _ => Ok(0),
        };
        match outcome {
            Ok(changed) => writeln!(self.out, "{changed} flags changed")?,
            Err(e) => writeln!(self.out, "Refresh failed: {e}")?,
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // screens
    // -------------------------------------------------------------------------

    async fn render(&mut self) -> Result<(), AppError> {
        if !self.is_ready() {
            writeln!(self.out, "{LOADING}")?;
            return Ok(());
        }
        match self.ctx.auth.user().map(|u| u.key.clone()) {
            Some(user) => self.render_flags(&user).await,
            None => self.render_login(),
        }
    }

    fn render_login(&mut self) -> Result<(), AppError> {
        if let Some(message) = self.ctx.auth.take_logout_message() {
            writeln!(self.out, "{message}")?;
        }
        writeln!(self.out, "{} ({})", self.ctx.config.app_name, self.ctx.config.environment)?;
        writeln!(self.out, "Not logged in. Use `login <name>` to continue.")?;
        Ok(())
    }

    async fn render_flags(&mut self, user: &str) -> Result<(), AppError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let context = self.ctx.evaluation_context();
        let console = session.sync.console_level(&context).await;
        let sdk = session.sync.sdk_level(&context).await;
        let keys = session.sync.keys().clone();

        writeln!(self.out, "Logged in as {user}")?;
        writeln!(self.out, "  {}: {} [{}]", keys.console, console.value.describe(), console.reason)?;
        writeln!(self.out, "  {}: {} [{}]", keys.sdk, sdk.value, sdk.reason)?;
        Ok(())
    }

    fn status(&mut self) -> Result<(), AppError> {
        let state = self.sync_state();
        let stored = stored_sdk_log_level(self.ctx.local.as_ref());
        let client_level = self
            .client_sdk_level()
            .map_or_else(|| "none".to_owned(), |l| l.to_string());
        let user = self
            .ctx
            .auth
            .user()
            .map_or_else(|| flags::ANONYMOUS_KEY.to_owned(), |u| u.key.clone());
        let mode = if self.ctx.offline { "offline" } else { "remote" };

        writeln!(self.out, "environment: {}", self.ctx.config.environment)?;
        writeln!(self.out, "application: {}", self.ctx.config.app_name)?;
        writeln!(self.out, "mode: {mode}")?;
        writeln!(self.out, "flag client: {state:?}")?;
        writeln!(self.out, "stored SDK log level: {stored}")?;
        writeln!(self.out, "client SDK log level: {client_level}")?;
        writeln!(self.out, "console level: {}", self.ctx.logger.level().describe())?;
        writeln!(self.out, "user: {user}")?;
        writeln!(self.out, "restarts: {}", self.restarts)?;
        if let Some(session) = &self.session {
            for (key, value) in session.sync.snapshot() {
                writeln!(self.out, "cached {key}: {value}")?;
            }
        }
        Ok(())
    }

    fn flush_notices(&mut self) -> Result<(), AppError> {
        let pending: Vec<String> = self
            .notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for line in pending {
            writeln!(self.out, "{line}")?;
        }
        Ok(())
    }
}

/// One line per changed flag; console levels are shown as `N (LABEL)`.
fn describe_changes(console_key: &str, changes: &ChangeSet) -> Vec<String> {
    let render = |key: &str, value: &Value| {
        if key == console_key {
            if let Ok(level) = ConsoleLevel::from_value(value) {
                return level.describe();
            }
        }
        value.to_string()
    };
    changes
        .iter()
        .map(|(key, change)| {
            let previous = change
                .previous
                .as_ref()
                .map_or_else(|| "unset".to_owned(), |v| render(key, v));
            format!("Flag {key} changed: {previous} -> {}", render(key, &change.current))
        })
        .collect()
}

#[cfg(test)]
#[path = "app_test.rs"]
mod tests;
