//! Buffered overlay over the real workdir.
//!
//! Writes and deletes are held in memory until [`OverlayFs::flush`]. Reads see the
//! buffer first and fall back to disk. Flush is all-or-nothing: every write is staged
//! to a sibling temp file before anything is renamed into place, and a failure while
//! applying restores what was already applied. The prior on-disk state of every
//! flushed path is journaled so the last flush can be reverted.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};

use crate::core::paths::relative_components;

const STAGE_SUFFIX: &str = "ralph-stage";

#[derive(Debug, Clone)]
pub struct OverlayFs {
    root: PathBuf,
    writes: BTreeMap<String, String>,
    deletes: BTreeSet<String>,
    /// Prior contents of paths touched by the last flush (`None` = did not exist).
    journal: Vec<JournalEntry>,
}

impl OverlayFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writes: BTreeMap::new(),
            deletes: BTreeSet::new(),
            journal: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` to its workdir-relative key (`src/lib.rs`).
    pub fn key(&self, path: &str) -> Result<String> {
        let parts = relative_components(Path::new(path), &self.root)
            .ok_or_else(|| anyhow!("path escapes workdir: {path}"))?;
        if parts.is_empty() {
            bail!("path resolves to the workdir itself: {path}");
        }
        Ok(parts.join("/"))
    }

    pub fn read(&self, path: &str) -> Result<String> {
        let key = self.key(path)?;
        if self.deletes.contains(&key) {
            bail!("file not found: {key} (pending delete)");
        }
        if let Some(content) = self.writes.get(&key) {
            return Ok(content.clone());
        }
        let full = self.root.join(&key);
        fs::read_to_string(&full).with_context(|| format!("read {}", full.display()))
    }

    pub fn write(&mut self, path: &str, content: &str) -> Result<()> {
        let key = self.key(path)?;
        self.deletes.remove(&key);
        self.writes.insert(key, content.to_string());
        Ok(())
    }

    pub fn delete(&mut self, path: &str) -> Result<()> {
        let key = self.key(path)?;
        self.writes.remove(&key);
        self.deletes.insert(key);
        Ok(())
    }

    pub fn is_clean(&self) -> bool {
        self.writes.is_empty() && self.deletes.is_empty()
    }

    /// Pending write paths followed by pending delete paths, each sorted.
    pub fn pending_changes(&self) -> Vec<String> {
        self.writes
            .keys()
            .chain(self.deletes.iter())
            .cloned()
            .collect()
    }

    pub fn discard(&mut self) {
        if !self.is_clean() {
            debug!(
                writes = self.writes.len(),
                deletes = self.deletes.len(),
                "discarding buffered changes"
            );
        }
        self.writes.clear();
        self.deletes.clear();
    }

    /// Apply buffered changes to disk.
    ///
    /// Prior contents are journaled and every write is staged before anything becomes
    /// visible. If applying fails partway, the paths already applied are restored from
    /// the journal. On any failure the buffer is kept so the caller can retry or roll back.
    #[instrument(skip_all, fields(writes = self.writes.len(), deletes = self.deletes.len()))]
    pub fn flush(&mut self) -> Result<()> {
        self.journal.clear();
        if self.is_clean() {
            debug!("nothing to flush");
            return Ok(());
        }

        let mut journal = Vec::with_capacity(self.writes.len() + self.deletes.len());
        for key in self.writes.keys().chain(self.deletes.iter()) {
            let target = self.root.join(key);
            let prior = snapshot(&target)?;
            journal.push((target, prior));
        }

        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(self.writes.len());
        for (key, content) in &self.writes {
            let target = self.root.join(key);
            match stage_write(&target, content) {
                Ok(tmp) => staged.push((tmp, target)),
                Err(err) => {
                    warn!(path = %key, err = %err, "staging failed, nothing flushed");
                    remove_staged(&staged);
                    return Err(err.context(format!("stage {key}")));
                }
            }
        }

        // `journal` lists writes then deletes, in the order they are applied below.
        let mut applied = 0;
        for (idx, (tmp, target)) in staged.iter().enumerate() {
            if let Err(err) = fs::rename(tmp, target) {
                remove_staged(&staged[idx..]);
                undo_partial(&journal[..applied]);
                return Err(err).with_context(|| format!("replace {}", target.display()));
            }
            applied += 1;
        }

        for key in &self.deletes {
            let target = self.root.join(key);
            match fs::remove_file(&target) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(path = %key, "delete target already absent");
                }
                Err(err) => {
                    undo_partial(&journal[..applied]);
                    return Err(err).with_context(|| format!("delete {}", target.display()));
                }
            }
            applied += 1;
        }

        debug!(
            writes = self.writes.len(),
            deletes = self.deletes.len(),
            "flushed overlay"
        );
        self.writes.clear();
        self.deletes.clear();
        self.journal = journal;
        Ok(())
    }

    /// Restore every path touched by the last flush to its prior state.
    #[instrument(skip_all, fields(paths = self.journal.len()))]
    pub fn revert_last_flush(&mut self) -> Result<()> {
        let journal = std::mem::take(&mut self.journal);
        restore(&journal)
    }
}

type JournalEntry = (PathBuf, Option<Vec<u8>>);

/// Undo applied entries, newest first. Keeps going past failures and reports the first.
fn restore(entries: &[JournalEntry]) -> Result<()> {
    let mut first_err = None;
    for (target, prior) in entries.iter().rev() {
        let result = match prior {
            Some(bytes) => fs::write(target, bytes),
            None => match fs::remove_file(target) {
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(err) = result {
            warn!(path = %target.display(), err = %err, "failed to restore path");
            if first_err.is_none() {
                first_err = Some(anyhow!("restore {}: {err}", target.display()));
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn undo_partial(applied: &[JournalEntry]) {
    if applied.is_empty() {
        return;
    }
    warn!(paths = applied.len(), "flush failed partway, restoring applied paths");
    if let Err(err) = restore(applied) {
        warn!(err = %format!("{err:#}"), "partial flush not fully restored");
    }
}

fn snapshot(target: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(target) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("snapshot {}", target.display())),
    }
}

fn stage_write(target: &Path, content: &str) -> Result<PathBuf> {
    let parent = target
        .parent()
        .ok_or_else(|| anyhow!("path missing parent {}", target.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let name = target
        .file_name()
        .ok_or_else(|| anyhow!("path missing file name {}", target.display()))?;
    let tmp = parent.join(format!(
        ".{}.{}-{}",
        name.to_string_lossy(),
        STAGE_SUFFIX,
        std::process::id()
    ));
    fs::write(&tmp, content).with_context(|| format!("write temp file {}", tmp.display()))?;
    Ok(tmp)
}

fn remove_staged(staged: &[(PathBuf, PathBuf)]) {
    for (tmp, _) in staged {
        if let Err(err) = fs::remove_file(tmp) {
            warn!(path = %tmp.display(), err = %err, "failed to remove staged file");
        }
    }
}
