// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

mod helpers;

use helpers::{LauncherHandle, pid_is_alive, wait_for_pid_gone, write_script};
use nix::sys::signal::Signal;
use std::time::Duration;

const FAKE_SERVER: &str = r#"
daemon: true
run:
  - method: shell.run
    params:
      path: app
      message:
        - "echo 'loading model...'"
        - "echo '* Running on local URL:  http://127.0.0.1:7860'"
        - "exec sleep 300"
      on:
        - event: '/http:\/\/127\.0\.0\.1:\d{2,5}/'
          done: true
  - method: local.set
    params:
      url: "{{input.event[0]}}"
  - method: notify
    params:
      html: "Web UI ready at {{local.url}}"
"#;

// ===========================================================================
// Group 1: Daemon lifecycle
// ===========================================================================

#[test]
fn test_start_publishes_url_and_stops_on_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("app")).unwrap();
    let script = write_script(dir.path(), "start.yaml", FAKE_SERVER);
    let state = dir.path().join("state.json");

    let mut launcher = LauncherHandle::start(&[
        "run",
        script.to_str().unwrap(),
        "--state-file",
        state.to_str().unwrap(),
        "--ready-timeout",
        "10",
    ]);
    assert!(
        launcher.wait_for_output_default("url=http://127.0.0.1:7860"),
        "launcher should print the published URL"
    );
    assert!(launcher.has_output("Web UI ready at http://127.0.0.1:7860"));
    assert!(launcher.wait_for_output_default("supervising 1 daemon(s)"));

    let published: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state).unwrap()).unwrap();
    assert_eq!(published["url"], "http://127.0.0.1:7860");

    let pids = launcher.spawned_pids();
    assert_eq!(pids.len(), 1, "expected one spawned server");
    assert!(pid_is_alive(pids[0]), "server should still be running");

    let status = launcher.stop();
    assert!(status.success(), "launcher should exit cleanly on SIGTERM");
    assert!(
        wait_for_pid_gone(pids[0], Duration::from_secs(5)),
        "server should be stopped with the launcher"
    );
}

#[test]
fn test_launcher_fails_when_daemons_exit_on_their_own() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "short.yaml",
        r#"
daemon: true
run:
  - method: shell.run
    params:
      message: "echo 'http://127.0.0.1:8080'; sleep 1"
      on:
        - event: 'http://127\.0\.0\.1:\d+'
          done: true
"#,
    );

    let mut launcher = LauncherHandle::start(&["run", script.to_str().unwrap()]);
    let status = launcher.wait_with_timeout(Duration::from_secs(10));
    assert!(!status.success(), "a crashed daemon should surface as a failure");
    assert!(launcher.has_output("supervising 1 daemon(s)"));
    assert!(launcher.has_output("all daemons exited on their own: [shell.run#1] exited (code=0)"));
}

#[test]
fn test_signal_during_readiness_wait_stops_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "slow.yaml",
        r#"
daemon: true
run:
  - method: shell.run
    params:
      message: "exec sleep 300"
      on:
        - event: 'http://127\.0\.0\.1:\d+'
          done: true
"#,
    );

    let mut launcher = LauncherHandle::start(&["run", script.to_str().unwrap()]);
    assert!(launcher.wait_for_output_default("spawned (pid="));
    let pids = launcher.spawned_pids();
    assert_eq!(pids.len(), 1);

    launcher.send_signal(Signal::SIGINT);
    let status = launcher.wait_with_timeout(Duration::from_secs(10));
    assert_eq!(status.code(), Some(1), "launcher should exit with an error, not die");
    assert!(launcher.has_output("interrupted by SIGINT"));
    assert!(
        wait_for_pid_gone(pids[0], Duration::from_secs(5)),
        "the child must not outlive an interrupted launcher"
    );
}

#[test]
fn test_signal_during_command_stops_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "install.yaml",
        "run:\n  - method: shell.run\n    params:\n      message: exec sleep 300\n",
    );

    let mut launcher = LauncherHandle::start(&["run", script.to_str().unwrap()]);
    assert!(launcher.wait_for_output_default("spawned (pid="));
    let pids = launcher.spawned_pids();

    let status = launcher.stop();
    assert!(!status.success());
    assert!(launcher.has_output("interrupted by SIGTERM"));
    assert!(wait_for_pid_gone(pids[0], Duration::from_secs(5)));
}

// ===========================================================================
// Group 2: Failures
// ===========================================================================

#[test]
fn test_exit_before_ready_fails() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "crash.yaml",
        r#"
daemon: true
run:
  - method: shell.run
    params:
      message: "echo 'ImportError: no module named gradio'; exit 3"
      on:
        - event: 'http://127\.0\.0\.1:\d+'
          done: true
  - method: notify
    params:
      html: "should not be shown"
"#,
    );

    let mut launcher = LauncherHandle::start(&["run", script.to_str().unwrap()]);
    let status = launcher.wait_with_timeout(Duration::from_secs(10));
    assert!(!status.success());
    assert!(launcher.has_output("ImportError: no module named gradio"));
    assert!(launcher.has_output("code=3"));
    assert!(!launcher.has_output("should not be shown"));
}

#[test]
fn test_ready_timeout_stops_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "silent.yaml",
        r#"
daemon: true
run:
  - method: shell.run
    params:
      message: "exec sleep 300"
      on:
        - event: 'http://127\.0\.0\.1:\d+'
          done: true
"#,
    );

    let mut launcher = LauncherHandle::start(&[
        "run",
        script.to_str().unwrap(),
        "--ready-timeout",
        "1",
        "--stop-timeout",
        "2",
    ]);
    let status = launcher.wait_with_timeout(Duration::from_secs(10));
    assert!(!status.success());
    assert!(launcher.has_output("no readiness match within 1000ms"));

    let pids = launcher.spawned_pids();
    assert_eq!(pids.len(), 1);
    assert!(wait_for_pid_gone(pids[0], Duration::from_secs(5)));
}

// ===========================================================================
// Group 3: One-shot scripts and checks
// ===========================================================================

#[test]
fn test_reset_script_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("app/env/bin")).unwrap();
    std::fs::write(dir.path().join("app/app.py"), "print('hi')\n").unwrap();
    let script = write_script(
        dir.path(),
        "reset.yaml",
        include_str!("../scripts/reset.yaml"),
    );

    let mut launcher = LauncherHandle::start(&["run", script.to_str().unwrap()]);
    let status = launcher.wait_with_timeout(Duration::from_secs(10));
    assert!(status.success());
    assert!(launcher.has_output("Reset complete!"));
    assert!(!dir.path().join("app").exists());
}

#[test]
fn test_cwd_overrides_script_directory() {
    let scripts = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let script = write_script(
        scripts.path(),
        "touch.yaml",
        "run:\n  - method: shell.run\n    params:\n      message: touch marker\n",
    );

    let mut launcher = LauncherHandle::start(&[
        "run",
        script.to_str().unwrap(),
        "--cwd",
        work.path().to_str().unwrap(),
    ]);
    assert!(launcher.wait_with_timeout(Duration::from_secs(10)).success());
    assert!(work.path().join("marker").exists());
    assert!(!scripts.path().join("marker").exists());
}

#[test]
fn test_check_shipped_scripts() {
    let scripts = concat!(env!("CARGO_MANIFEST_DIR"), "/scripts");
    for name in ["install.yaml", "start.yaml", "link.yaml", "reset.yaml"] {
        let path = format!("{scripts}/{name}");
        let mut launcher = LauncherHandle::start(&["check", &path]);
        let status = launcher.wait_with_timeout(Duration::from_secs(10));
        assert!(status.success(), "{name} should pass the check");
        assert!(launcher.has_output(": ok ("));
    }
}

#[test]
fn test_check_rejects_bad_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "bad.yaml",
        r#"
run:
  - method: shell.run
    params:
      message: python app.py
      on:
        - event: 'http://(unclosed'
          done: true
"#,
    );

    let mut launcher = LauncherHandle::start(&["check", script.to_str().unwrap()]);
    let status = launcher.wait_with_timeout(Duration::from_secs(10));
    assert!(!status.success());
    assert!(launcher.has_output("invalid readiness pattern"));
}
