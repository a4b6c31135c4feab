// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Sequential interpreter for launcher scripts.

use crate::config::{LinkParams, RemoveParams, Script, ShellParams, Step};
use crate::env::parse_environment_file;
use crate::error::WatchError;
use crate::host::Host;
use crate::process::{DEFAULT_STOP_TIMEOUT, LaunchSpec, ManagedProcess, ProcessMonitor};
use crate::state::ProcessState;
use crate::template::{TemplateContext, render};
use crate::variables::Variables;
use crate::watch::{Launch, LogSink, OutputSink, Readiness, ReadinessRule, drain_output, launch};
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::time::{Duration, timeout};

/// How long a finished command's remaining output may take to reach the sink.
const OUTPUT_FLUSH_GRACE: Duration = Duration::from_millis(500);

/// What a script run leaves behind.
#[derive(Debug)]
pub struct RunOutcome {
    pub variables: Variables,
    /// Processes started by `shell.run` steps that are still owned by the run,
    /// including one a step was waiting on when the run was abandoned.
    pub daemons: Vec<ManagedProcess>,
}

impl RunOutcome {
    /// Terminate every remaining daemon, last started first.
    pub async fn shutdown(self, stop_timeout: Duration) {
        for daemon in self.daemons.into_iter().rev() {
            let name = daemon.name().to_string();
            let state = daemon.terminate(stop_timeout).await;
            info!("[{name}] stopped: {state}");
        }
    }
}

pub struct Runner<H: Host> {
    root: PathBuf,
    host: H,
    sink: Arc<dyn OutputSink>,
    ready_timeout: Option<Duration>,
    variables: Variables,
    /// Kept daemons plus whatever the current step is waiting on.
    owned: Vec<ManagedProcess>,
}

impl<H: Host> Runner<H> {
    /// `root` is the directory relative paths in the script resolve against.
    pub fn new(root: impl Into<PathBuf>, host: H) -> Self {
        Self {
            root: root.into(),
            host,
            sink: Arc::new(LogSink),
            ready_timeout: None,
            variables: Variables::default(),
            owned: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Default bound on readiness waits for steps without their own `timeout`.
    pub fn with_ready_timeout(mut self, limit: Option<Duration>) -> Self {
        self.ready_timeout = limit;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            variables: self.variables,
            daemons: self.owned,
        }
    }

    /// Run every step in order, stopping at the first failure. Processes kept
    /// alive so far stay owned by the runner either way.
    pub async fn run(&mut self, script: &Script) -> Result<()> {
        let mut input: Option<Readiness> = None;
        for (index, step) in script.run.iter().enumerate() {
            let number = index + 1;
            debug!("step {number} ({}) starting", step.method());
            self.run_step(number, step, script, &mut input)
                .await
                .with_context(|| format!("step {number} ({}) failed", step.method()))?;
        }
        info!("script finished ({} step(s))", script.run.len());
        Ok(())
    }

    async fn run_step(
        &mut self,
        number: usize,
        step: &Step,
        script: &Script,
        input: &mut Option<Readiness>,
    ) -> Result<()> {
        match step {
            Step::RunShell(params) => {
                let spec = self.shell_spec(number, params, script, input.as_ref())?;
                *input = match params.readiness_rule() {
                    Some(rule) => self.run_watched(&spec, &rule, params.timeout).await?,
                    None => {
                        self.run_to_completion(spec, params.timeout).await?;
                        None
                    }
                };
            }
            Step::SetVariable(values) => {
                let rendered = self.render_all(values, input.as_ref())?;
                for (name, value) in rendered {
                    info!("set {name}={value}");
                    self.variables.set(name, value);
                }
            }
            Step::RemovePath(RemoveParams { path }) => {
                let path = self.render(path, input.as_ref())?;
                let target = resolve_relative(&self.root, &path)?;
                self.host.remove_path(&target)?;
            }
            Step::LinkPath(LinkParams { path, venv }) => {
                let mut dir = self.root.clone();
                for part in [path, venv].into_iter().flatten() {
                    let part = self.render(part, input.as_ref())?;
                    dir = resolve_relative(&dir, &part)?;
                }
                let linked = self.host.link_path(&dir)?;
                debug!("fs.link linked {linked} file(s)");
            }
            Step::Notify(params) => {
                let message = self.render(&params.html, input.as_ref())?;
                self.host.notify(&message);
            }
        }
        Ok(())
    }

    fn render(&self, template: &str, input: Option<&Readiness>) -> Result<String> {
        let ctx = TemplateContext {
            input,
            variables: &self.variables,
            cwd: &self.root,
        };
        render(template, &ctx)
    }

    fn render_all(
        &self,
        values: &BTreeMap<String, String>,
        input: Option<&Readiness>,
    ) -> Result<Vec<(String, String)>> {
        values
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.render(value, input)?)))
            .collect()
    }

    fn shell_spec(
        &self,
        number: usize,
        params: &ShellParams,
        script: &Script,
        input: Option<&Readiness>,
    ) -> Result<LaunchSpec> {
        let commands = params
            .commands()
            .iter()
            .map(|command| self.render(command, input))
            .collect::<Result<Vec<_>>>()?;

        let working_dir = match &params.path {
            Some(path) => resolve_relative(&self.root, &self.render(path, input)?)?,
            None => self.root.clone(),
        };
        let mut spec = LaunchSpec::shell(format!("shell.run#{number}"), commands.join(" && "))
            .working_dir(&working_dir);

        // Later sources win: script env, then the environment file, then the step.
        for (key, value) in &script.env {
            spec = spec.env(key, self.render(value, input)?);
        }
        if let Some(file) = &params.environment_file {
            let file = resolve_relative(&self.root, &self.render(file, input)?)?;
            spec.env.extend(parse_environment_file(&file)?);
        }
        for (key, value) in &params.env {
            spec = spec.env(key, self.render(value, input)?);
        }

        if let Some(venv) = &params.venv {
            let venv_dir = resolve_relative(&working_dir, &self.render(venv, input)?)?;
            let inherited = spec
                .env
                .get("PATH")
                .cloned()
                .or_else(|| std::env::var("PATH").ok())
                .unwrap_or_default();
            let bin = venv_dir.join("bin");
            let path = if inherited.is_empty() {
                bin.display().to_string()
            } else {
                format!("{}:{inherited}", bin.display())
            };
            spec = spec
                .env("PATH", path)
                .env("VIRTUAL_ENV", venv_dir.display().to_string());
        }
        Ok(spec)
    }

    /// Take ownership of a process for as long as a step waits on it. If the
    /// run is abandoned midway the process is still reachable for shutdown.
    fn adopt(&mut self, process: ManagedProcess) -> ProcessMonitor {
        let monitor = process.monitor();
        self.owned.push(process);
        monitor
    }

    fn release(&mut self, monitor: &ProcessMonitor) -> Option<ManagedProcess> {
        let index = self.owned.iter().position(|p| p.pid() == monitor.pid())?;
        Some(self.owned.remove(index))
    }

    /// Launch through the watcher. Returns the captured event.
    async fn run_watched(
        &mut self,
        spec: &LaunchSpec,
        rule: &ReadinessRule,
        step_timeout: Option<u64>,
    ) -> Result<Option<Readiness>> {
        let limit = step_timeout.map(Duration::from_secs).or(self.ready_timeout);
        let Launch { process, watch } = launch(spec, rule, Arc::clone(&self.sink))?;
        let monitor = self.adopt(process);

        let ready = match watch.wait(limit).await {
            Ok(ready) => ready,
            // Without `done` the step is about the exit; a clean one without a
            // match just leaves no event behind.
            Err(WatchError::ProcessExited {
                code: Some(0),
                signal: None,
            }) if !rule.done => {
                self.release(&monitor);
                return Ok(None);
            }
            Err(e) => {
                // A process still running stays owned, so whoever handles the
                // failure can stop it.
                if !monitor.is_running() {
                    self.release(&monitor);
                }
                return Err(e.into());
            }
        };

        if rule.done {
            info!("[{}] ready, keeping it running (pid={})", spec.name, monitor.pid());
            return Ok(Some(ready));
        }

        let state = monitor.wait_exit().await;
        self.release(&monitor);
        ensure_success(&spec.name, state)?;
        Ok(Some(ready))
    }

    async fn run_to_completion(
        &mut self,
        spec: LaunchSpec,
        step_timeout: Option<u64>,
    ) -> Result<()> {
        let (process, output) = ManagedProcess::spawn(&spec)?;
        let drained = drain_output(spec.name.clone(), output, Arc::clone(&self.sink));
        let monitor = self.adopt(process);

        let state = match step_timeout.map(Duration::from_secs) {
            Some(limit) => match timeout(limit, monitor.wait_exit()).await {
                Ok(state) => state,
                Err(_) => {
                    warn!("[{}] still running after {}s, stopping it", spec.name, limit.as_secs());
                    if let Some(process) = self.release(&monitor) {
                        process.terminate(DEFAULT_STOP_TIMEOUT).await;
                    }
                    bail!("[{}] timed out after {}s", spec.name, limit.as_secs());
                }
            },
            None => monitor.wait_exit().await,
        };
        self.release(&monitor);

        // Background children may hold the pipe open past the exit.
        if timeout(OUTPUT_FLUSH_GRACE, drained).await.is_err() {
            debug!("[{}] output still open after exit, not waiting for it", spec.name);
        }
        ensure_success(&spec.name, state)
    }
}

fn ensure_success(name: &str, state: ProcessState) -> Result<()> {
    match state {
        ProcessState::Exited { code: 0 } => Ok(()),
        state => bail!("[{name}] {state}"),
    }
}

/// Join a script-supplied relative path onto `base`, refusing anything that
/// could point outside it.
fn resolve_relative(base: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("path '{relative}' must stay inside {}", base.display()),
        }
    }
    Ok(base.join(path))
}
