// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

pub mod config;
pub mod env;
pub mod error;
pub mod host;
pub mod process;
pub mod runner;
pub mod state;
pub mod template;
pub mod variables;
pub mod watch;

pub use error::WatchError;
pub use process::{LaunchSpec, ManagedProcess, ProcessMonitor};
pub use state::ProcessState;
pub use watch::{
    Launch, OutputSink, PendingWatch, Readiness, ReadinessRule, WatchCanceller, WatchResult,
    launch, watch,
};
