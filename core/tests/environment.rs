#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use core_test_support::skip_if_no_shell;
use core_test_support::test_config;
use pretty_assertions::assert_eq;
use shellmux_core::CreateSessionParams;
use shellmux_core::ExecCommandParams;
use shellmux_core::SessionManager;

const NON_UTF8_VAR: &str = "SHELLMUX_NON_UTF8";

// Kept in its own test binary: it mutates the process environment.
#[test]
fn non_utf8_inherited_variable_reaches_the_shell() {
    skip_if_no_shell!();
    // SAFETY: no other thread exists yet; the runtime is built afterwards.
    unsafe {
        std::env::set_var(NON_UTF8_VAR, OsStr::from_bytes(b"\xff\xfe"));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let manager = SessionManager::new(test_config());
        manager
            .create_session(CreateSessionParams::named("bytes").with_env("SHELLMUX_PLAIN", "ok"))
            .await
            .expect("session creation must not reject non-UTF-8 values");

        let output = manager
            .execute_command(ExecCommandParams::new(
                "bytes",
                format!("printf '%s' \"${NON_UTF8_VAR}\" | od -An -tx1; echo \"$SHELLMUX_PLAIN\""),
            ))
            .await
            .unwrap();
        let lines: Vec<&str> = output.stdout.lines().map(str::trim).collect();
        assert_eq!(lines, vec!["ff fe", "ok"]);

        manager.shutdown().await;
    });
}
