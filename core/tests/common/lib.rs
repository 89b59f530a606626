#![allow(clippy::expect_used)]

use std::path::Path;

use shellmux_core::SessionManagerConfig;
use tempfile::TempDir;

/// Config with short grace periods and tight polling so tests finish fast.
pub fn test_config() -> SessionManagerConfig {
    SessionManagerConfig {
        termination_grace_ms: 500,
        job_termination_grace_ms: 500,
        default_timeout_secs: 10,
        background_grace_secs: 2,
        poll_interval_ms: 5,
        ..SessionManagerConfig::default()
    }
}

/// Returns `true` when the default shell is unavailable, so tests can bail
/// out on minimal hosts.
pub fn shell_unavailable() -> bool {
    !Path::new(&SessionManagerConfig::default().shell).exists()
}

pub fn scratch_dir() -> TempDir {
    tempfile::tempdir().expect("create scratch dir")
}

#[macro_export]
macro_rules! skip_if_no_shell {
    () => {
        if $crate::shell_unavailable() {
            println!("Skipping test because /bin/bash is not available.");
            return;
        }
    };
}
