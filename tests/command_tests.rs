#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use gatefs::delivery::{CommandDelivery, DeliveryGateway as _};
use gatefs::otp::OtpGenerator;
use gatefs::prompt::{CommandPrompt, PromptChannel as _, PromptError};
use secrecy::ExposeSecret as _;
use tempfile::TempDir;

/// Write an executable `sh` script into `dir`.
fn stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn scratch() -> TempDir {
    tempfile::tempdir().unwrap()
}

#[tokio::test]
async fn text_prompt_keeps_only_the_first_line() {
    let dir = scratch();
    let prompt = CommandPrompt::new(stub(dir.path(), "zenity", "printf 'alice\\nsecond line\\n'"));
    let answer = prompt.prompt_text("t", "m", 30).await.unwrap();
    assert_eq!(answer, "alice");
}

#[tokio::test]
async fn long_answers_are_cut_at_the_limit() {
    let dir = scratch();
    let prompt = CommandPrompt::new(stub(dir.path(), "zenity", "printf 'ABCDEFGHIJ\\n'"));
    let answer = prompt
        .prompt_password("t", "m", 7, None)
        .await
        .unwrap();
    assert_eq!(answer.expose_secret(), "ABCDEFG");
}

#[tokio::test]
async fn cancelled_dialog_reads_as_empty() {
    let dir = scratch();
    let prompt = CommandPrompt::new(stub(dir.path(), "zenity", "exit 1"));
    assert_eq!(prompt.prompt_text("t", "m", 30).await.unwrap(), "");
}

#[tokio::test]
async fn dialog_timeout_exit_status_is_reported() {
    let dir = scratch();
    let prompt = CommandPrompt::new(stub(dir.path(), "zenity", "exit 5"));
    let err = prompt
        .prompt_password("t", "m", 7, Some(Duration::from_secs(60)))
        .await
        .unwrap_err();
    assert!(matches!(err, PromptError::TimedOut));
}

#[tokio::test]
async fn unexpected_exit_status_is_a_failure() {
    let dir = scratch();
    let prompt = CommandPrompt::new(stub(dir.path(), "zenity", "exit 3"));
    let err = prompt.prompt_text("t", "m", 30).await.unwrap_err();
    assert!(matches!(err, PromptError::Failed(status) if status.code() == Some(3)));
}

#[tokio::test]
async fn missing_program_fails_to_spawn() {
    let dir = scratch();
    let prompt = CommandPrompt::new(dir.path().join("not-installed"));
    let err = prompt.prompt_text("t", "m", 30).await.unwrap_err();
    assert!(matches!(err, PromptError::Spawn { .. }));
}

#[tokio::test]
async fn hung_dialog_is_killed_after_timeout_and_grace() {
    let dir = scratch();
    let prompt = CommandPrompt::new(stub(dir.path(), "zenity", "exec sleep 30"))
        .with_grace(Duration::from_millis(100));

    let started = Instant::now();
    let err = prompt
        .prompt_password("t", "m", 7, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, PromptError::TimedOut));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn password_prompt_passes_zenity_arguments() {
    let dir = scratch();
    let log = dir.path().join("args");
    let script = stub(
        dir.path(),
        "zenity",
        &format!("for a in \"$@\"; do echo \"$a\" >> '{}'; done\necho x", log.display()),
    );
    let prompt = CommandPrompt::new(script);
    prompt
        .prompt_password("Passcode", "Enter it", 7, Some(Duration::from_secs(60)))
        .await
        .unwrap();

    let args = std::fs::read_to_string(&log).unwrap();
    let args: Vec<_> = args.lines().collect();
    assert_eq!(
        args,
        ["--password", "--title=Passcode: Enter it", "--timeout=60"]
    );
}

#[tokio::test]
async fn error_dialog_ignores_the_exit_status() {
    let dir = scratch();
    let prompt = CommandPrompt::new(stub(dir.path(), "zenity", "exit 1"));
    prompt.prompt_error("nope").await.unwrap();
}

#[tokio::test]
async fn delivery_receives_address_then_token() {
    let dir = scratch();
    let log = dir.path().join("delivered");
    let script = stub(
        dir.path(),
        "deliver",
        &format!("echo \"$@\" > '{}'", log.display()),
    );
    let delivery = CommandDelivery::new(script).with_args(["--via", "sms"]);
    let token = OtpGenerator::default().generate();

    delivery.deliver("+5511999", &token).await;

    let line = std::fs::read_to_string(&log).unwrap();
    assert_eq!(line.trim_end(), format!("--via sms +5511999 {}", token.expose()));
}

#[tokio::test]
async fn delivery_failures_are_swallowed() {
    let dir = scratch();
    let token = OtpGenerator::default().generate();

    CommandDelivery::new(stub(dir.path(), "deliver", "exit 42"))
        .deliver("addr", &token)
        .await;
    CommandDelivery::new(dir.path().join("not-installed"))
        .deliver("addr", &token)
        .await;
}
