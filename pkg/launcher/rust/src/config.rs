// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::watch::{ReadinessMatcher, ReadinessRule};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// A launcher script: an ordered list of steps run one after another.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Script {
    /// Keep processes launched by `shell.run` steps alive after the last step.
    #[serde(default)]
    pub daemon: bool,
    /// Environment applied to every `shell.run` step.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub run: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "method", content = "params")]
pub enum Step {
    #[serde(rename = "shell.run")]
    RunShell(ShellParams),
    #[serde(rename = "fs.link")]
    LinkPath(LinkParams),
    #[serde(rename = "fs.rm")]
    RemovePath(RemoveParams),
    #[serde(rename = "notify")]
    Notify(NotifyParams),
    #[serde(rename = "local.set")]
    SetVariable(BTreeMap<String, String>),
}

impl Step {
    pub fn method(&self) -> &'static str {
        match self {
            Step::RunShell(_) => "shell.run",
            Step::LinkPath(_) => "fs.link",
            Step::RemovePath(_) => "fs.rm",
            Step::Notify(_) => "notify",
            Step::SetVariable(_) => "local.set",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ShellParams {
    /// Working directory relative to the script root.
    pub path: Option<String>,
    /// Virtualenv directory relative to `path`; its `bin/` goes first on PATH.
    pub venv: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub environment_file: Option<String>,
    pub message: Message,
    #[serde(default)]
    pub on: Vec<EventRule>,
    /// Seconds. Bounds the readiness wait when `on` is set, the whole run otherwise.
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Message {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EventRule {
    /// Regex, optionally written as a `/pattern/flags` literal.
    pub event: String,
    #[serde(default)]
    pub done: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LinkParams {
    pub path: Option<String>,
    pub venv: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RemoveParams {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NotifyParams {
    pub html: String,
}

impl ShellParams {
    pub fn commands(&self) -> &[String] {
        match &self.message {
            Message::One(command) => std::slice::from_ref(command),
            Message::Many(commands) => commands,
        }
    }

    /// Only the first `on` entry is watched.
    pub fn readiness_rule(&self) -> Option<ReadinessRule> {
        self.on.first().map(EventRule::to_rule)
    }
}

impl EventRule {
    pub fn to_rule(&self) -> ReadinessRule {
        ReadinessRule {
            pattern: event_pattern(&self.event),
            done: self.done,
        }
    }
}

/// Turn a `/pattern/flags` literal into a plain pattern with inline flags.
/// Anything else is returned unchanged.
pub fn event_pattern(event: &str) -> String {
    let literal = event
        .strip_prefix('/')
        .and_then(|rest| rest.rsplit_once('/'))
        .filter(|(_, flags)| flags.chars().all(|c| "gimsuy".contains(c)));
    let Some((body, flags)) = literal else {
        return event.to_string();
    };

    let inline: String = flags.chars().filter(|c| "ims".contains(*c)).collect();
    let body = body.replace(r"\/", "/");
    if inline.is_empty() {
        body
    } else {
        format!("(?{inline}){body}")
    }
}

impl Script {
    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Catch what would otherwise only fail halfway through a run.
    pub fn validate(&self) -> Result<()> {
        for (index, step) in self.run.iter().enumerate() {
            let Step::RunShell(params) = step else {
                continue;
            };
            if params.commands().iter().all(|c| c.trim().is_empty()) {
                bail!("step {} (shell.run) has no message to run", index + 1);
            }
            for rule in &params.on {
                ReadinessMatcher::new(&rule.to_rule())
                    .with_context(|| format!("step {} (shell.run)", index + 1))?;
            }
        }
        Ok(())
    }
}

pub fn load_script(path: &Path) -> Result<Script> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let script =
        Script::from_yaml(&contents).with_context(|| format!("parsing {}", path.display()))?;
    script
        .validate()
        .with_context(|| format!("validating {}", path.display()))?;
    Ok(script)
}
