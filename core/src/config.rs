use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const CONFIG_TOML_FILE: &str = "config.toml";

/// Tunables for the session manager. Every field has a default so an empty
/// TOML document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionManagerConfig {
    pub shell: PathBuf,
    pub shell_args: Vec<String>,
    pub reap_interval_secs: u64,
    pub max_idle_secs: u64,
    pub termination_grace_ms: u64,
    pub job_termination_grace_ms: u64,
    pub default_timeout_secs: u64,
    pub background_grace_secs: u64,
    pub poll_interval_ms: u64,
    pub final_recheck_attempts: u32,
    pub final_recheck_interval_ms: u64,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            shell_args: vec!["--norc".to_string(), "--noprofile".to_string()],
            reap_interval_secs: 300,
            max_idle_secs: 3_600,
            termination_grace_ms: 5_000,
            job_termination_grace_ms: 5_000,
            default_timeout_secs: 30,
            background_grace_secs: 5,
            poll_interval_ms: 10,
            final_recheck_attempts: 5,
            final_recheck_interval_ms: 20,
        }
    }
}

impl SessionManagerConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Like [`Self::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("shell must not be empty".to_string()));
        }
        for (name, value) in [
            ("reap_interval_secs", self.reap_interval_secs),
            ("max_idle_secs", self.max_idle_secs),
            ("poll_interval_ms", self.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn job_termination_grace(&self) -> Duration {
        Duration::from_millis(self.job_termination_grace_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_secs(self.background_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn final_recheck_interval(&self) -> Duration {
        Duration::from_millis(self.final_recheck_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_document_yields_defaults() {
        let config = SessionManagerConfig::from_toml_str("").unwrap();
        assert_eq!(config, SessionManagerConfig::default());
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let config = SessionManagerConfig::from_toml_str(
            r#"
shell = "/bin/sh"
max_idle_secs = 60
"#,
        )
        .unwrap();
        assert_eq!(config.shell, PathBuf::from("/bin/sh"));
        assert_eq!(config.max_idle(), Duration::from_secs(60));
        assert_eq!(config.reap_interval_secs, 300);
        assert_eq!(config.shell_args, vec!["--norc", "--noprofile"]);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = SessionManagerConfig::from_toml_str("poll_interval_ms = 0").unwrap_err();
        assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("poll_interval_ms"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = SessionManagerConfig::from_toml_str("no_such_key = 1").unwrap_err();
        assert_matches!(err, ConfigError::Parse { .. });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            SessionManagerConfig::load_or_default(&dir.path().join(CONFIG_TOML_FILE)).unwrap();
        assert_eq!(config, SessionManagerConfig::default());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_TOML_FILE);
        std::fs::write(&path, "default_timeout_secs = 7\n").unwrap();
        let config = SessionManagerConfig::load(&path).unwrap();
        assert_eq!(config.default_timeout(), Duration::from_secs(7));
    }
}
