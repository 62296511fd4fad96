#![cfg(unix)]

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use pretty_assertions::assert_eq;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

const HARNESS: &str = env!("CARGO_BIN_EXE_failure-harness");

fn harness(args: &[&str]) -> (Output, Duration) {
    let started = Instant::now();
    let output = Command::new(HARNESS)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .unwrap();
    (output, started.elapsed())
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_exit_mode_uses_exit_code_after_two_seconds() {
    let (output, elapsed) = harness(&["--profile", "p1", "--type", "exit", "--exitCode", "7"]);

    assert_eq!(output.status.code(), Some(7));
    assert!(elapsed >= Duration::from_millis(1_900), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    assert!(stdout(&output).contains("[harness] profile=p1 mode=exit exiting with code 7"));
}

#[test]
fn test_timeout_mode_exits_one_after_duration() {
    let (output, elapsed) = harness(&["--profile", "p1", "--type", "timeout", "--duration", "500"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(elapsed >= Duration::from_millis(450), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    assert!(stdout(&output).contains("ran for 500ms, exiting with code 1"));
}

#[test]
fn test_error_mode_dies_of_a_panic() {
    let (output, _) = harness(&["--profile", "p1", "--type", "error", "--delay", "100"]);

    assert_eq!(output.status.code(), Some(101));
    assert!(stdout(&output).contains("raising unhandled error"));
    assert!(String::from_utf8_lossy(&output.stderr).contains("injected failure for profile p1"));
}

#[test]
fn test_hang_mode_survives_until_sigterm() {
    let mut child = Command::new(HARNESS)
        .args(["--profile", "p1", "--type", "hang"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_secs(5));
    assert!(child.try_wait().unwrap().is_none(), "hang mode exited on its own");

    let signalled = Instant::now();
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(signalled.elapsed() < Duration::from_secs(3), "no exit after SIGTERM");
        std::thread::sleep(Duration::from_millis(20));
    };
    assert_eq!(status.code(), Some(0));

    let output = child.wait_with_output().unwrap();
    assert!(stdout(&output).contains("received SIGTERM, exiting with code 0"));
}

#[test]
fn test_sigint_interrupts_exit_mode_gracefully() {
    let child = Command::new(HARNESS)
        .args(["--profile", "p1", "--type", "exit", "--exitCode", "9", "--delay", "10000"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_millis(500));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();

    let output = child.wait_with_output().unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("received SIGINT"));
}

#[test]
fn test_unknown_type_is_a_usage_error() {
    let (output, _) = harness(&["--profile", "p1", "--type", "explode"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("--exitCode"));
}

#[test]
fn test_missing_profile_is_a_usage_error() {
    let (output, _) = harness(&["--type", "hang"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_help_exits_zero() {
    let (output, _) = harness(&["--help"]);

    assert_eq!(output.status.code(), Some(0));
    assert!(stdout(&output).contains("--profile"));
}

#[test]
fn test_sigterm_right_after_start_exits_zero() {
    use std::io::{BufRead, BufReader};

    let mut child = Command::new(HARNESS)
        .args(["--profile", "p1", "--type", "exit", "--exitCode", "9"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();
    let first = lines.next().unwrap().unwrap();
    assert_eq!(first, "[harness] profile=p1 mode=exit started");
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(0));
    let rest: Vec<String> = lines.map(Result::unwrap).collect();
    assert!(rest.iter().any(|l| l.ends_with("received SIGTERM, exiting with code 0")));
}
