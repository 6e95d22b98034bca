//! Line commands for the terminal front end.

use serde_json::Value;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShellError {
    #[error("unknown command `{0}`; type `help` for a list")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid JSON value: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Login(String),
    Logout(Option<String>),
    Flags,
    Demo,
    /// Push a flag value into the offline flag service.
    Set { key: String, value: Value },
    Refresh,
    Status,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  login <name>          log in as <name>
  logout [message]      log out, optionally leaving a message
  flags                 show current flag values
  demo                  run the flag evaluation demo
  set <key> <json>      change a flag (offline mode)
  refresh               re-fetch flags from the service
  status                show client and session state
  help                  show this list
  quit                  exit";

impl Command {
    /// Parse one input line. Blank lines parse to `None`.
    ///
    /// # Errors
    ///
    /// Returns a [`ShellError`] for unknown commands or bad arguments.
    pub fn parse(line: &str) -> Result<Option<Self>, ShellError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "login" if rest.is_empty() => return Err(ShellError::Usage("login <name>")),
            "login" => Self::Login(rest.to_owned()),
            "logout" => Self::Logout((!rest.is_empty()).then(|| rest.to_owned())),
            "flags" => Self::Flags,
            "demo" => Self::Demo,
            "set" => parse_set(rest)?,
            "refresh" => Self::Refresh,
            "status" => Self::Status,
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            _ => return Err(ShellError::UnknownCommand(word.to_owned())),
        };
        Ok(Some(command))
    }
}

/// `set <key> <json>`. A bare word that is not JSON is taken as a string.
fn parse_set(rest: &str) -> Result<Command, ShellError> {
    let Some((key, raw)) = rest.split_once(char::is_whitespace) else {
        return Err(ShellError::Usage("set <key> <json>"));
    };
    let raw = raw.trim();
    let value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) if raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
            Value::String(raw.to_owned())
        }
        Err(e) => return Err(ShellError::InvalidJson(e.to_string())),
    };
    Ok(Command::Set { key: key.to_owned(), value })
}

#[cfg(test)]
#[path = "shell_test.rs"]
mod tests;
