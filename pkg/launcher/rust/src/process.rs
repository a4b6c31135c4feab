// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::WatchError;
use crate::state::ProcessState;
use log::{debug, info, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{Duration, timeout};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const SIGKILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to start a child. Not modified once the launch begins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Label used in log lines.
    pub name: String,
    pub working_dir: Option<PathBuf>,
    pub command: String,
    pub args: Vec<String>,
    /// Overrides applied on top of the inherited environment.
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// `sh -c <script>`, the way script steps run their commands.
    pub fn shell(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(name, "sh").args(["-c".to_string(), script.into()])
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Read end of the pipe shared by the child's stdout and stderr.
pub type OutputPipe = pipe::Receiver;

/// Owning handle of a spawned child. Only the owner may terminate it.
///
/// The OS child itself lives in an exit task that records the final state;
/// dropping this handle never kills the process.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    pid: u32,
    state: watch::Receiver<ProcessState>,
}

/// Read-only view of a managed process, shareable with other collaborators.
#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    name: String,
    pid: u32,
    state: watch::Receiver<ProcessState>,
}

impl ManagedProcess {
    /// Spawn the child with stdin closed and stdout+stderr both writing into
    /// one pipe, so the returned reader sees output in emission order.
    ///
    /// The child leads its own process group so termination reaches whatever
    /// it starts (`sh -c` wrappers in particular).
    pub fn spawn(spec: &LaunchSpec) -> Result<(Self, OutputPipe), WatchError> {
        let spawn_err = |e: std::io::Error| WatchError::spawn(&spec.command, &e);

        let (writer, reader) = pipe::pipe().map_err(spawn_err)?;
        let stdout = writer.into_blocking_fd().map_err(spawn_err)?;
        let stderr = stdout.try_clone().map_err(spawn_err)?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0);
        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        let (state_tx, state_rx) = watch::channel(ProcessState::Spawned);
        let mut child = cmd.spawn().map_err(spawn_err)?;
        // The command still holds our copies of the write end; the reader only
        // sees EOF once every writer is closed.
        drop(cmd);

        let pid = child.id().unwrap_or(0);
        info!(
            "[{}] spawned (pid={}, cmd={} {})",
            spec.name,
            pid,
            spec.command,
            spec.args.join(" ")
        );
        transition(&state_tx, ProcessState::Running);

        let name = spec.name.clone();
        tokio::spawn(async move {
            let next = match child.wait().await {
                Ok(status) => ProcessState::from_exit_status(status),
                Err(e) => {
                    warn!("[{name}] failed to wait on child: {e}");
                    ProcessState::Exited { code: -1 }
                }
            };
            info!("[{name}] {next}");
            transition(&state_tx, next);
        });

        let process = Self {
            name: spec.name.clone(),
            pid,
            state: state_rx,
        };
        Ok((process, reader))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_alive()
    }

    pub fn monitor(&self) -> ProcessMonitor {
        ProcessMonitor {
            name: self.name.clone(),
            pid: self.pid,
            state: self.state.clone(),
        }
    }

    /// Resolve once the child has exited, returning its final state.
    pub async fn wait_exit(&self) -> ProcessState {
        wait_for_exit(&self.state).await
    }

    /// Send `sig` to the child's process group.
    pub fn send_signal(&self, sig: Signal) {
        if !self.is_running() || self.pid == 0 {
            return;
        }
        if let Err(e) = signal::killpg(Pid::from_raw(self.pid as i32), sig) {
            warn!("[{}] failed to send {sig}: {e}", self.name);
        }
    }

    /// SIGTERM, wait up to `stop_timeout`, then SIGKILL.
    pub async fn terminate(self, stop_timeout: Duration) -> ProcessState {
        if !self.is_running() {
            return self.state();
        }
        info!("[{}] sending SIGTERM", self.name);
        self.send_signal(Signal::SIGTERM);
        if let Ok(state) = timeout(stop_timeout, self.wait_exit()).await {
            return state;
        }

        warn!(
            "[{}] stop timeout ({}s) reached, sending SIGKILL",
            self.name,
            stop_timeout.as_secs()
        );
        self.send_signal(Signal::SIGKILL);
        match timeout(SIGKILL_TIMEOUT, self.wait_exit()).await {
            Ok(state) => state,
            Err(_) => {
                warn!("[{}] still running after SIGKILL, giving up", self.name);
                self.state()
            }
        }
    }

    /// Let the child run on without anyone holding its handle.
    pub fn detach(self) {
        debug!("[{}] detached (pid={})", self.name, self.pid);
    }
}

impl ProcessMonitor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_alive()
    }

    pub async fn wait_exit(&self) -> ProcessState {
        wait_for_exit(&self.state).await
    }
}

fn transition(tx: &watch::Sender<ProcessState>, next: ProcessState) {
    tx.send_if_modified(|current| {
        if current.can_transition_to(next) {
            *current = next;
            true
        } else {
            false
        }
    });
}

async fn wait_for_exit(state: &watch::Receiver<ProcessState>) -> ProcessState {
    let mut rx = state.clone();
    if let Ok(state) = rx.wait_for(|s| !s.is_alive()).await {
        return *state;
    }
    // The exit task always publishes before dropping the sender.
    *rx.borrow()
}
