//! Lexical path resolution relative to the sandbox workdir.
//!
//! Rules and requested paths are compared as component lists, never as raw strings, so
//! `src` covers `src/lib.rs` but not `srcx/lib.rs`. Nothing here touches the filesystem.

use std::path::{Component, Path, PathBuf};

/// Resolve `path` against `workdir` and return its components relative to `workdir`.
///
/// Returns `None` when the path escapes the workdir (via `..` or an unrelated absolute
/// path). The workdir itself resolves to an empty component list.
pub fn relative_components(path: &Path, workdir: &Path) -> Option<Vec<String>> {
    let base = normalize(workdir);
    let joined = if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&base.join(path))
    };
    let rest = joined.strip_prefix(&base).ok()?;
    // A relative workdir strips nothing from `..` or absolute paths, so anything other
    // than plain names means the path left the workdir.
    rest.components()
        .map(|component| match component {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

/// True when `path` is `rule` itself or nested beneath it (both relative to `workdir`).
pub fn is_within(path: &Path, rule: &Path, workdir: &Path) -> bool {
    let Some(path) = relative_components(path, workdir) else {
        return false;
    };
    let Some(rule) = relative_components(rule, workdir) else {
        return false;
    };
    path.len() >= rule.len() && path.iter().zip(&rule).all(|(a, b)| a == b)
}

/// Join relative components back into a `/`-separated display path.
pub fn display_relative(path: &Path, workdir: &Path) -> String {
    match relative_components(path, workdir) {
        Some(parts) if parts.is_empty() => ".".to_string(),
        Some(parts) => parts.join("/"),
        None => path.display().to_string(),
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
