//! End-to-end starter tests.
//!
//! Drive the real binary through the direct engine, which exercises
//! the full master / stage-1 / stage-2 dance, the RPC channel, the
//! start barrier, and wait-status propagation without needing
//! privileges or an image file.

use std::os::unix::process::ExitStatusExt;
use std::process::Command;

fn starter() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cryptbox"));
    cmd.args(["run", "--engine", "direct", "--"]);
    cmd
}

#[test]
fn successful_payload_exits_zero() {
    let status = starter().arg("/bin/true").status().unwrap();
    assert_eq!(status.code(), Some(0));
}

#[test]
fn payload_exit_code_propagates() {
    let status = starter()
        .args(["/bin/sh", "-c", "exit 7"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(7));
}

#[test]
fn failing_payload_exits_nonzero() {
    let status = starter().arg("/bin/false").status().unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn signaled_payload_reraises_on_the_master() {
    // The payload kills itself with SIGKILL; the master re-raises the
    // same signal after monitoring, so our wait sees a signal death,
    // not an exit code.
    let status = starter()
        .args(["/bin/sh", "-c", "kill -9 $$"])
        .status()
        .unwrap();
    assert_eq!(status.signal(), Some(9));
}

#[test]
fn terminated_payload_reports_sigterm() {
    let status = starter()
        .args(["/bin/sh", "-c", "kill -TERM $$"])
        .status()
        .unwrap();
    assert_eq!(status.signal(), Some(15));
}

#[test]
fn missing_payload_fails_with_a_setup_error() {
    let output = starter().arg("/definitely/not/a/binary").output().unwrap();
    assert!(!output.status.success());
    // The failure surfaces through the child's status, not a panic.
    assert_eq!(output.status.code(), Some(255));
}

#[test]
fn unknown_engine_is_rejected_up_front() {
    let output = Command::new(env!("CARGO_BIN_EXE_cryptbox"))
        .args(["run", "--engine", "warp", "--", "/bin/true"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown engine"));
}

#[test]
fn image_engine_requires_an_image() {
    let output = Command::new(env!("CARGO_BIN_EXE_cryptbox"))
        .args(["run", "--", "/bin/true"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--image is required"));
}
