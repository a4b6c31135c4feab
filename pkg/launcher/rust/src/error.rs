// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Terminal outcomes of a watch other than readiness.

use crate::state::ProcessState;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    #[error("failed to spawn '{command}': {message}")]
    Spawn {
        command: String,
        kind: io::ErrorKind,
        message: String,
    },

    #[error("invalid readiness pattern: {0}")]
    Config(String),

    #[error("no readiness match within {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("process exited before becoming ready ({})", exit_description(.code, .signal))]
    ProcessExited {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("watch cancelled")]
    Cancelled,
}

impl WatchError {
    pub(crate) fn spawn(command: &str, err: &io::Error) -> Self {
        WatchError::Spawn {
            command: command.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub(crate) fn exited(state: ProcessState) -> Self {
        WatchError::ProcessExited {
            code: state.code(),
            signal: state.signal(),
        }
    }
}

fn exit_description(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (*code, *signal) {
        (Some(code), _) => format!("code={code}"),
        (None, Some(signal)) => format!("signal={signal}"),
        (None, None) => "unknown status".to_string(),
    }
}
