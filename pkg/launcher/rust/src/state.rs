// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Command built, child not confirmed yet.
    Spawned,
    /// Child process is alive.
    Running,
    /// Exited on its own with an exit code.
    Exited { code: i32 },
    /// Terminated by a signal.
    Killed { signal: i32 },
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        matches!(self, ProcessState::Spawned | ProcessState::Running)
    }

    pub fn code(self) -> Option<i32> {
        match self {
            ProcessState::Exited { code } => Some(code),
            _ => None,
        }
    }

    pub fn signal(self) -> Option<i32> {
        match self {
            ProcessState::Killed { signal } => Some(signal),
            _ => None,
        }
    }

    pub fn from_exit_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ProcessState::Exited { code },
            (None, Some(signal)) => ProcessState::Killed { signal },
            // Neither a code nor a signal is not reachable on unix; report a failure code.
            (None, None) => ProcessState::Exited { code: -1 },
        }
    }

    pub(crate) fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Spawned, Running)
                | (Spawned, Exited { .. })
                | (Spawned, Killed { .. })
                | (Running, Exited { .. })
                | (Running, Killed { .. })
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Spawned => write!(f, "spawned"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Exited { code } => write!(f, "exited (code={code})"),
            ProcessState::Killed { signal } => write!(f, "killed (signal={signal})"),
        }
    }
}
