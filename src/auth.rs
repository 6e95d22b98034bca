#[cfg(test)]
#[path = "auth_test.rs"]
mod auth_test;

use std::sync::Arc;

use flags::{ApplicationContext, EvaluationContext, UserContext};

use crate::storage::{KeyValueStore, LOGOUT_MESSAGE_KEY, StorageError, USER_KEY, load_json, save_json};

/// Who is logged in, backed by local storage so it survives a restart.
///
/// The logout message lives in session storage and is read at most once.
#[derive(Clone)]
pub struct AuthState {
    local: Arc<dyn KeyValueStore>,
    session: Arc<dyn KeyValueStore>,
    user: Option<UserContext>,
}

impl AuthState {
    /// Restore the persisted user, if any.
    pub fn load(local: Arc<dyn KeyValueStore>, session: Arc<dyn KeyValueStore>) -> Self {
        let user = load_json::<UserContext>(local.as_ref(), USER_KEY);
        if let Some(user) = &user {
            tracing::debug!(user = %user.key, "restored logged-in user");
        }
        Self { local, session, user }
    }

    /// Log in as `username`. A blank name is ignored and returns `false`.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the user cannot be persisted.
    pub fn login(&mut self, username: &str) -> Result<bool, StorageError> {
        let username = username.trim();
        if username.is_empty() {
            return Ok(false);
        }
        let user = UserContext::named(username);
        save_json(self.local.as_ref(), USER_KEY, &user)?;
        tracing::info!(user = %user.key, "logged in");
        self.user = Some(user);
        Ok(true)
    }

    /// Forget the user. `message` is shown once on the next login screen.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if either store cannot be written.
    pub fn logout(&mut self, message: Option<&str>) -> Result<(), StorageError> {
        if let Some(message) = message.map(str::trim).filter(|m| !m.is_empty()) {
            self.session.set(LOGOUT_MESSAGE_KEY, message)?;
        }
        self.local.remove(USER_KEY)?;
        if let Some(user) = self.user.take() {
            tracing::info!(user = %user.key, "logged out");
        }
        Ok(())
    }

    /// Read and clear the pending logout message.
    pub fn take_logout_message(&self) -> Option<String> {
        let message = self.session.get(LOGOUT_MESSAGE_KEY)?;
        if let Err(e) = self.session.remove(LOGOUT_MESSAGE_KEY) {
            tracing::warn!(error = %e, "failed to clear logout message");
        }
        Some(message)
    }

    #[must_use]
    pub fn user(&self) -> Option<&UserContext> {
        self.user.as_ref()
    }

    /// Evaluation context for the current user, anonymous when logged out.
    #[must_use]
    pub fn context(&self, application: ApplicationContext) -> EvaluationContext {
        EvaluationContext::new(self.user.as_ref(), application)
    }
}
