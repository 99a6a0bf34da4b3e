//! CLI smoke tests — verify the commands that work without a database or
//! cache configured. No network access required.

use std::process::Command;

fn run_cli(args: &[&str]) -> (i32, String, String) {
    let bin = env!("CARGO_BIN_EXE_nezuko-core");
    let output = Command::new(bin)
        .args(args)
        .env("RUST_LOG", "")
        .output()
        .expect("failed to execute nezuko-core binary");
    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

#[test]
fn cli_help_flag() {
    let (code, stdout, _stderr) = run_cli(&["--help"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("Commands:"));
}

#[test]
fn cli_version_command() {
    let (code, stdout, _stderr) = run_cli(&["version"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("nezuko-core"));
    assert!(stdout.contains('.'));
}

#[test]
fn cli_run_help() {
    let (code, stdout, _stderr) = run_cli(&["run", "--help"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("Run"));
}

#[test]
fn cli_migrate_help() {
    let (code, stdout, _stderr) = run_cli(&["migrate", "--help"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("schema"));
}

#[test]
fn cli_invalid_command() {
    let (code, _stdout, stderr) = run_cli(&["nonexistent-command"]);
    assert_ne!(code, 0);
    assert!(
        stderr.contains("error") || stderr.contains("unrecognized"),
        "expected an error for an invalid subcommand, got stderr: {}",
        stderr
    );
}

#[test]
fn cli_run_without_config_fails_cleanly() {
    // No NEZUKO_DATABASE_URL/NEZUKO_ENCRYPTION_KEY set: should fail fast
    // with a config error, not hang or panic.
    let bin = env!("CARGO_BIN_EXE_nezuko-core");
    let output = Command::new(bin)
        .arg("run")
        .env_remove("NEZUKO_DATABASE_URL")
        .env_remove("NEZUKO_ENCRYPTION_KEY")
        .env_remove("DATABASE_URL")
        .env_remove("ENCRYPTION_KEY")
        .output()
        .expect("failed to execute nezuko-core binary");
    assert_ne!(output.status.code().unwrap_or(-1), 0);
}
