// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Side effects of script steps other than running commands.

use anyhow::{Context, Result, bail};
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub trait Host {
    /// Remove a file or a whole directory tree. A missing path is not an error.
    fn remove_path(&self, path: &Path) -> Result<()>;

    /// Link redundant files under `dir` together. Returns how many were linked.
    fn link_path(&self, dir: &Path) -> Result<usize>;

    /// Fire-and-forget message for the operator.
    fn notify(&self, message: &str);
}

/// Acts on the local filesystem and reports notifications on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

impl Host for SystemHost {
    fn remove_path(&self, path: &Path) -> Result<()> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{} does not exist, nothing to remove", path.display());
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("inspecting {}", path.display())),
        };
        if metadata.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
        .with_context(|| format!("removing {}", path.display()))?;
        info!("removed {}", path.display());
        Ok(())
    }

    fn link_path(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            bail!("{} is not a directory", dir.display());
        }
        let linked = dedup_hard_links(dir)?;
        info!("linked {linked} redundant file(s) under {}", dir.display());
        Ok(linked)
    }

    fn notify(&self, message: &str) {
        info!("notify: {message}");
        println!("{message}");
    }
}

/// Replace regular files whose content duplicates an earlier file (walk order,
/// sorted by name) with hard links to that earlier file. Empty files and files
/// already sharing an inode are left alone.
fn dedup_hard_links(dir: &Path) -> Result<usize> {
    let mut by_size: BTreeMap<u64, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let len = entry.metadata()?.len();
        if len > 0 {
            by_size.entry(len).or_default().push(entry.into_path());
        }
    }

    let mut linked = 0;
    for candidates in by_size.values().filter(|paths| paths.len() > 1) {
        let mut originals: Vec<(&PathBuf, Vec<u8>)> = Vec::new();
        for path in candidates {
            let content = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            let Some((original, _)) = originals.iter().find(|(_, c)| *c == content) else {
                originals.push((path, content));
                continue;
            };
            if same_inode(original, path)? {
                continue;
            }
            replace_with_link(original, path)?;
            debug!("{} -> {}", path.display(), original.display());
            linked += 1;
        }
    }
    Ok(linked)
}

fn same_inode(a: &Path, b: &Path) -> Result<bool> {
    let (a, b) = (fs::metadata(a)?, fs::metadata(b)?);
    Ok(a.dev() == b.dev() && a.ino() == b.ino())
}

/// Link next to `path` first, then rename over it, so `path` never goes missing.
fn replace_with_link(original: &Path, path: &Path) -> Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    let mut tmp_name = std::ffi::OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(".pklink");
    let tmp = path.with_file_name(tmp_name);

    fs::hard_link(original, &tmp)
        .with_context(|| format!("linking {} to {}", tmp.display(), original.display()))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}
