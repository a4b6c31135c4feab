// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! `{{ ... }}` substitution in step parameters.
//!
//! Supported expressions: `input.event[N]` (group N of the previous watched
//! step), `local.NAME` (a published variable), and `cwd` (the script root).

use crate::variables::Variables;
use crate::watch::Readiness;
use anyhow::{Context, Result, bail};
use std::path::Path;

pub struct TemplateContext<'a> {
    pub input: Option<&'a Readiness>,
    pub variables: &'a Variables,
    pub cwd: &'a Path,
}

pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .with_context(|| format!("unterminated '{{{{' in {template:?}"))?;
        out.push_str(&resolve(after[..end].trim(), ctx)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve(expr: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    if expr == "cwd" {
        return Ok(ctx.cwd.display().to_string());
    }
    if let Some(name) = expr.strip_prefix("local.") {
        return ctx
            .variables
            .get(name)
            .with_context(|| format!("variable '{name}' is not set"));
    }
    if let Some(index) = expr
        .strip_prefix("input.event[")
        .and_then(|rest| rest.strip_suffix(']'))
    {
        let index: usize = index
            .trim()
            .parse()
            .with_context(|| format!("invalid event index in '{expr}'"))?;
        let event = ctx
            .input
            .with_context(|| format!("'{expr}' used but no previous step captured an event"))?;
        return event
            .group(index)
            .map(str::to_string)
            .with_context(|| format!("event has no group {index}"));
    }
    bail!("unknown template expression '{expr}'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::{ReadinessMatcher, ReadinessRule};

    fn event(line: &str) -> Readiness {
        let rule = ReadinessRule::new(r"(http://127\.0\.0\.1):(\d+)");
        ReadinessMatcher::new(&rule).unwrap().observe(line).unwrap()
    }

    #[test]
    fn test_render_event_groups() {
        let ready = event("Running on http://127.0.0.1:7860");
        let vars = Variables::default();
        let ctx = TemplateContext {
            input: Some(&ready),
            variables: &vars,
            cwd: Path::new("/srv/app"),
        };
        assert_eq!(
            render("{{input.event[0]}}", &ctx).unwrap(),
            "http://127.0.0.1:7860"
        );
        assert_eq!(
            render("port={{ input.event[2] }} in {{cwd}}", &ctx).unwrap(),
            "port=7860 in /srv/app"
        );
        assert!(render("{{input.event[7]}}", &ctx).is_err());
        assert!(render("{{input.event[x]}}", &ctx).is_err());
    }

    #[test]
    fn test_render_variables() {
        let vars = Variables::default();
        vars.set("url", "http://127.0.0.1:7860");
        let ctx = TemplateContext {
            input: None,
            variables: &vars,
            cwd: Path::new("."),
        };
        assert_eq!(
            render("Open {{local.url}} in a browser", &ctx).unwrap(),
            "Open http://127.0.0.1:7860 in a browser"
        );
        assert!(render("{{local.port}}", &ctx).is_err());
        assert!(render("{{input.event[0]}}", &ctx).is_err(), "no event yet");
    }

    #[test]
    fn test_render_plain_and_malformed() {
        let vars = Variables::default();
        let ctx = TemplateContext {
            input: None,
            variables: &vars,
            cwd: Path::new("."),
        };
        assert_eq!(render("python app.py", &ctx).unwrap(), "python app.py");
        assert_eq!(render("", &ctx).unwrap(), "");
        assert!(render("{{local.url", &ctx).is_err());
        assert!(render("{{env.HOME}}", &ctx).is_err());
    }
}
