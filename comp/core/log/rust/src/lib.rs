// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! `log` backend writing agent-style lines:
//!
//! ```text
//! 2026-10-19 12:00:00 UTC | PK-LAUNCHER | INFO | (src/watch.rs:120 in pk_launcher::watch) | message
//! ```

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second] UTC");

pub struct AgentLogger {
    component: String,
    level: LevelFilter,
    out: Mutex<Box<dyn Write + Send>>,
}

impl AgentLogger {
    /// Logger writing to stderr.
    pub fn new(component: &str, level: LevelFilter) -> Self {
        Self::with_writer(component, level, Box::new(io::stderr()))
    }

    pub fn with_writer(component: &str, level: LevelFilter, out: Box<dyn Write + Send>) -> Self {
        Self {
            component: component.to_ascii_uppercase(),
            level,
            out: Mutex::new(out),
        }
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    fn format(&self, record: &Record<'_>) -> String {
        let timestamp = OffsetDateTime::now_utc()
            .format(TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| "-".to_string());
        let file = record.file().unwrap_or("?");
        let line = record.line().unwrap_or(0);
        let module = record.module_path().unwrap_or(record.target());
        format!(
            "{timestamp} | {} | {} | ({file}:{line} in {module}) | {}",
            self.component,
            record.level(),
            record.args()
        )
    }
}

impl Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        // Nowhere left to report a failed log write.
        let _ = writeln!(out, "{line}");
    }

    fn flush(&self) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = out.flush();
    }
}

/// Parse a level name as accepted on the command line. `warning` and `off`
/// are accepted alongside the `log` crate names.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.trim().to_ascii_lowercase().as_str() {
        "warning" => Some(LevelFilter::Warn),
        "none" => Some(LevelFilter::Off),
        other => other.parse().ok(),
    }
}

/// Install the process-wide logger writing to stderr.
pub fn init(component: &str, level: LevelFilter) -> Result<(), SetLoggerError> {
    init_with_logger(AgentLogger::new(component, level))
}

pub fn init_with_logger(logger: AgentLogger) -> Result<(), SetLoggerError> {
    let level = logger.level();
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level);
    Ok(())
}
