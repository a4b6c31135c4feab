// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Readiness watching: launch a child, scan its combined output line by line
//! for a pattern, and resolve exactly once.
//!
//! Matching is per line. A match split across two lines is never detected, and
//! a last line without a terminator is only tested once the pipe closes.
//! Resolving a watch never stops the child: the reader keeps draining the pipe
//! until EOF so the process cannot block on a full buffer.

use crate::error::WatchError;
use crate::process::{LaunchSpec, ManagedProcess, OutputPipe, ProcessMonitor};
use crate::state::ProcessState;
use log::{debug, info, warn};
use regex::Regex;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep_until, timeout};

/// Loopback URL announced by local web UIs, e.g. `http://127.0.0.1:7860`.
pub const LOOPBACK_URL_PATTERN: &str = r"http://127\.0\.0\.1:\d{2,5}";

/// How long output already written before the child exited may still match.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

pub type WatchResult = Result<Readiness, WatchError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessRule {
    pub pattern: String,
    /// A match ends the caller's wait. When false the caller is expected to
    /// keep waiting for the process to exit after the match is recorded.
    pub done: bool,
}

impl ReadinessRule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            done: true,
        }
    }

    pub fn loopback_url() -> Self {
        Self::new(LOOPBACK_URL_PATTERN)
    }

    pub fn compile(&self) -> Result<Regex, WatchError> {
        Regex::new(&self.pattern).map_err(|e| WatchError::Config(e.to_string()))
    }
}

/// Capture groups of the first matching line. Group 0 is the whole match;
/// groups that did not participate are empty strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    groups: Vec<String>,
}

impl Readiness {
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).map(String::as_str)
    }

    /// The matched text, e.g. the announced URL.
    pub fn url(&self) -> &str {
        self.group(0).unwrap_or_default()
    }

    pub fn into_groups(self) -> Vec<String> {
        self.groups
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Pending,
    Resolved,
}

/// Per-line transition function of a watch.
pub struct ReadinessMatcher {
    pattern: Regex,
    state: WatchState,
}

impl ReadinessMatcher {
    pub fn new(rule: &ReadinessRule) -> Result<Self, WatchError> {
        Ok(Self {
            pattern: rule.compile()?,
            state: WatchState::Pending,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.state == WatchState::Pending
    }

    /// Test one chunk. Returns the leftmost match the first time one is seen
    /// and `None` forever after.
    pub fn observe(&mut self, chunk: &str) -> Option<Readiness> {
        if self.state == WatchState::Resolved {
            return None;
        }
        let captures = self.pattern.captures(chunk)?;
        self.state = WatchState::Resolved;
        let groups = captures
            .iter()
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect();
        Some(Readiness { groups })
    }
}

/// Receives every output line of a launched process.
pub trait OutputSink: Send + Sync {
    fn line(&self, process: &str, line: &str);
}

/// Echoes output through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn line(&self, process: &str, line: &str) {
        info!("[{process}] {line}");
    }
}

/// Single result slot: the first resolver takes the sender, everyone after
/// that is ignored.
struct ResultSlot {
    tx: Mutex<Option<oneshot::Sender<WatchResult>>>,
}

impl ResultSlot {
    fn new(tx: oneshot::Sender<WatchResult>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn is_pending(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Returns whether this call resolved the watch.
    fn resolve(&self, result: WatchResult) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match tx {
            Some(tx) => {
                // The waiter may be gone; the slot is resolved either way.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}

/// A launched process and the watch on its output.
pub struct Launch {
    pub process: ManagedProcess,
    pub watch: PendingWatch,
}

pub struct PendingWatch {
    name: String,
    rx: oneshot::Receiver<WatchResult>,
    slot: Arc<ResultSlot>,
}

/// Withdraws a pending watch from another task. Does not touch the process.
#[derive(Clone)]
pub struct WatchCanceller {
    name: String,
    slot: Arc<ResultSlot>,
}

impl PendingWatch {
    pub fn canceller(&self) -> WatchCanceller {
        WatchCanceller {
            name: self.name.clone(),
            slot: Arc::clone(&self.slot),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.is_pending()
    }

    /// Wait for the result. With no `limit` this only returns on a match,
    /// process exit, or cancellation.
    pub async fn wait(mut self, limit: Option<Duration>) -> WatchResult {
        let Some(limit) = limit else {
            return self.receive().await;
        };
        if let Ok(received) = timeout(limit, &mut self.rx).await {
            return received.unwrap_or(Err(WatchError::Cancelled));
        }
        // A match may have claimed the slot in the meantime; then that wins.
        if self.slot.resolve(Err(WatchError::Timeout(limit))) {
            warn!(
                "[{}] no readiness match within {}ms, leaving the process running",
                self.name,
                limit.as_millis()
            );
        }
        self.receive().await
    }

    async fn receive(self) -> WatchResult {
        // The slot lives as long as `self`, so the sender is only ever dropped
        // after sending.
        self.rx.await.unwrap_or(Err(WatchError::Cancelled))
    }
}

impl WatchCanceller {
    /// Returns whether the watch was still pending.
    pub fn cancel(&self) -> bool {
        let cancelled = self.slot.resolve(Err(WatchError::Cancelled));
        if cancelled {
            info!("[{}] watch cancelled", self.name);
        }
        cancelled
    }
}

/// Spawn the child described by `spec` and start watching its output for
/// `rule`. An invalid pattern is reported before anything is spawned.
pub fn launch(
    spec: &LaunchSpec,
    rule: &ReadinessRule,
    sink: Arc<dyn OutputSink>,
) -> Result<Launch, WatchError> {
    let matcher = ReadinessMatcher::new(rule)?;
    let (process, output) = ManagedProcess::spawn(spec)?;

    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(ResultSlot::new(tx));
    tokio::spawn(watch_output(
        spec.name.clone(),
        output,
        matcher,
        Arc::clone(&slot),
        process.monitor(),
        sink,
    ));

    Ok(Launch {
        process,
        watch: PendingWatch {
            name: spec.name.clone(),
            rx,
            slot,
        },
    })
}

/// Launch, wait for readiness, and leave the process running in the
/// background whatever the outcome.
pub async fn watch(
    spec: &LaunchSpec,
    rule: &ReadinessRule,
    limit: Option<Duration>,
) -> WatchResult {
    let Launch { process, watch } = launch(spec, rule, Arc::new(LogSink))?;
    let result = watch.wait(limit).await;
    process.detach();
    result
}

/// Echo a process's output to `sink` until EOF, without matching.
pub fn drain_output(name: String, output: OutputPipe, sink: Arc<dyn OutputSink>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = LineReader::new(output);
        while let Some(line) = lines.next_line().await {
            sink.line(&name, &line);
        }
        debug!("[{name}] output drained");
    })
}

async fn watch_output(
    name: String,
    output: OutputPipe,
    mut matcher: ReadinessMatcher,
    slot: Arc<ResultSlot>,
    monitor: ProcessMonitor,
    sink: Arc<dyn OutputSink>,
) {
    let mut lines = LineReader::new(output);
    let mut exited: Option<ProcessState> = None;
    let mut drain_deadline: Option<Instant> = None;

    loop {
        // Exit and deadline go first: a background child that inherited the
        // pipe can keep it readable forever after the direct child is gone.
        let line = tokio::select! {
            biased;
            () = sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                if drain_deadline.is_some() =>
            {
                drain_deadline = None;
                if let Some(state) = exited {
                    resolve_exit(&name, &slot, state);
                }
                continue;
            }
            state = monitor.wait_exit(), if exited.is_none() => {
                exited = Some(state);
                drain_deadline = Some(Instant::now() + EXIT_DRAIN_GRACE);
                continue;
            }
            line = lines.next_line() => line,
        };
        let Some(line) = line else {
            break;
        };

        sink.line(&name, &line);
        if slot.is_pending()
            && let Some(ready) = matcher.observe(&line)
        {
            let url = ready.url().to_string();
            if slot.resolve(Ok(ready)) {
                info!("[{name}] ready: {url}");
            }
        }
    }

    let state = match exited {
        Some(state) => state,
        None => monitor.wait_exit().await,
    };
    resolve_exit(&name, &slot, state);
    debug!("[{name}] output reader exiting");
}

fn resolve_exit(name: &str, slot: &ResultSlot, state: ProcessState) {
    if slot.resolve(Err(WatchError::exited(state))) {
        warn!("[{name}] {state} before any readiness match");
    }
}

/// Longest line handed to the sink; longer runs are split at this size.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Byte-based line reader with lossy UTF-8 decoding, so stray non-UTF-8
/// output does not end the stream.
///
/// Lines end at `\n`, `\r\n` or a lone `\r` (progress bars redraw with `\r`).
struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    /// The last line ended with `\r`; a `\n` right after it belongs to it.
    skip_lf: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(output: R) -> Self {
        Self {
            inner: BufReader::new(output),
            buf: Vec::with_capacity(1024),
            skip_lf: false,
        }
    }

    /// Next line without its terminator, `None` at EOF or on a read error.
    ///
    /// Cancel safe: the only await is `fill_buf`, and bytes of an unfinished
    /// line stay in `buf` for the next call.
    async fn next_line(&mut self) -> Option<String> {
        loop {
            let available = match self.inner.fill_buf().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("output reader stopping on read error: {e}");
                    return self.take_partial();
                }
            };
            if available.is_empty() {
                return self.take_partial();
            }
            if self.skip_lf {
                self.skip_lf = false;
                if available[0] == b'\n' {
                    self.inner.consume(1);
                    continue;
                }
            }

            let room = MAX_LINE_BYTES - self.buf.len();
            let window = &available[..available.len().min(room)];
            match window.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(end) => {
                    self.skip_lf = window[end] == b'\r';
                    self.buf.extend_from_slice(&window[..end]);
                    self.inner.consume(end + 1);
                    return Some(self.take_line());
                }
                None => {
                    let len = window.len();
                    self.buf.extend_from_slice(window);
                    self.inner.consume(len);
                    if self.buf.len() >= MAX_LINE_BYTES {
                        return Some(self.take_line());
                    }
                }
            }
        }
    }

    fn take_partial(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}
