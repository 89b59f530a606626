use std::path::Path;

use anyhow::Result;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use pretty_assertions::assert_eq;
use serde_json::Value as JsonValue;
use tempfile::TempDir;

fn shellmux_command(home: &Path) -> Result<assert_cmd::Command> {
    let mut cmd = assert_cmd::Command::cargo_bin("shellmux")?;
    cmd.env("SHELLMUX_HOME", home);
    Ok(cmd)
}

fn bash_missing() -> bool {
    !Path::new("/bin/bash").exists()
}

#[test]
fn exec_prints_text_results_in_order() -> Result<()> {
    if bash_missing() {
        return Ok(());
    }
    let home = TempDir::new()?;

    shellmux_command(home.path())?
        .args(["exec", "export N=41", "echo $((N + 1))"])
        .assert()
        .success()
        .stdout(contains("STDOUT:\n42").and(contains("Exit code: 0")));

    Ok(())
}

#[test]
fn exec_json_reports_exit_code_and_cwd() -> Result<()> {
    if bash_missing() {
        return Ok(());
    }
    let home = TempDir::new()?;
    let work = TempDir::new()?;

    let output = shellmux_command(home.path())?
        .arg("exec")
        .arg("--json")
        .arg("--cwd")
        .arg(work.path())
        .args(["pwd", "exit_with() { return \"$1\"; }; exit_with 3"])
        .output()?;
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout)?;
    let results: Vec<JsonValue> = stdout
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(results.len(), 2);
    assert_eq!(
        results[0]["stdout"],
        JsonValue::String(work.path().canonicalize()?.display().to_string())
    );
    assert_eq!(results[1]["exit_code"], JsonValue::from(3));
    assert_eq!(results[1]["completed"], JsonValue::Bool(true));

    Ok(())
}

#[test]
fn exec_reports_timeouts_without_failing() -> Result<()> {
    if bash_missing() {
        return Ok(());
    }
    let home = TempDir::new()?;

    shellmux_command(home.path())?
        .args(["exec", "--timeout", "1", "sleep 2"])
        .assert()
        .success()
        .stdout(contains("Command timed out"));

    Ok(())
}

#[test]
fn exec_fails_for_missing_working_directory() -> Result<()> {
    let home = TempDir::new()?;

    shellmux_command(home.path())?
        .args(["exec", "--cwd"])
        .arg(home.path().join("does-not-exist"))
        .arg("true")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("failed to create session"));

    Ok(())
}

#[test]
fn invalid_config_is_rejected() -> Result<()> {
    let home = TempDir::new()?;
    std::fs::write(home.path().join("config.toml"), "poll_interval_ms = 0\n")?;

    shellmux_command(home.path())?
        .args(["exec", "true"])
        .assert()
        .failure()
        .stderr(contains("failed to load config"));

    Ok(())
}

#[test]
fn repl_switches_sessions_with_meta_commands() -> Result<()> {
    if bash_missing() {
        return Ok(());
    }
    let home = TempDir::new()?;
    let script = "\
X=main
:new other
echo ${X:-unset}
:use default
echo $X
:sessions
:kill other
:kill other
:quit
echo never
";

    shellmux_command(home.path())?
        .arg("repl")
        .write_stdin(script)
        .assert()
        .success()
        .stdout(
            contains("using session other")
                .and(contains("STDOUT:\nunset"))
                .and(contains("STDOUT:\nmain"))
                .and(contains("* default"))
                .and(contains("killed session other"))
                .and(contains("never").not()),
        )
        .stderr(contains("session 'other' not found"));

    Ok(())
}
