use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::de::Deserializer;
use serde::de::{self};
use shlex::try_join;

use crate::session_id::SessionId;

pub const DEFAULT_SESSION_ID: &str = "default";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSessionParams {
    #[serde(default)]
    pub session_id: Option<SessionId>,

    #[serde(default)]
    pub working_directory: Option<PathBuf>,

    /// Layered over the server's own environment at creation time.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl CreateSessionParams {
    pub fn named(session_id: impl Into<SessionId>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn in_directory(mut self, working_directory: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(working_directory.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecCommandParams {
    #[serde(default = "default_session_id")]
    pub session_id: SessionId,

    #[serde(deserialize_with = "deserialize_command")]
    pub command: String,

    /// Falls back to the configured default when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub background: bool,
}

impl ExecCommandParams {
    pub fn new(session_id: impl Into<SessionId>, command: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            command: command.into(),
            timeout_secs: None,
            background: false,
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn default_session_id() -> SessionId {
    SessionId::from(DEFAULT_SESSION_ID)
}

/// Accepts either a shell string or an argv array, which is quoted into a
/// single shell line.
fn deserialize_command<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum CommandSpec {
        Str(String),
        Seq(Vec<String>),
    }

    match CommandSpec::deserialize(deserializer)? {
        CommandSpec::Str(raw) => Ok(raw),
        CommandSpec::Seq(parts) => try_join(parts.iter().map(String::as_str))
            .map_err(|err| de::Error::custom(format!("failed to join command parts: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn exec_params_apply_defaults() {
        let params: ExecCommandParams =
            serde_json::from_value(json!({ "command": "echo hi" })).unwrap();
        assert_eq!(params.session_id, SessionId::from(DEFAULT_SESSION_ID));
        assert_eq!(params.command, "echo hi");
        assert_eq!(params.timeout(), None);
        assert!(!params.background);
    }

    #[test]
    fn exec_params_join_argv_with_quoting() {
        let params: ExecCommandParams = serde_json::from_value(json!({
            "session_id": "s1",
            "command": ["echo", "two words"],
            "timeout_secs": 5,
            "background": true,
        }))
        .unwrap();
        assert_eq!(
            shlex::split(&params.command),
            Some(vec!["echo".to_string(), "two words".to_string()])
        );
        assert_eq!(params.timeout(), Some(Duration::from_secs(5)));
        assert!(params.background);
    }

    #[test]
    fn create_params_builder() {
        let params = CreateSessionParams::named("s1")
            .in_directory("/tmp")
            .with_env("FOO", "bar");
        assert_eq!(params.session_id, Some(SessionId::from("s1")));
        assert_eq!(params.working_directory, Some(PathBuf::from("/tmp")));
        assert_eq!(params.environment.get("FOO").map(String::as_str), Some("bar"));
    }
}
