//! Materializing uploaded session files under the workspace root.
//!
//! Every path is resolved against the workspace root before anything is
//! written: `..` segments may not climb above the root, absolute paths are
//! re-rooted beneath it, and existing symlinks along the path (the file or
//! any parent directory) may not lead outside it.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::{AppError, Result};

/// Validate that `candidate` resolves inside `workspace_root`.
///
/// Returns the absolute path on success.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if:
/// - The workspace root cannot be canonicalized.
/// - The candidate contains `..` segments that escape the root.
/// - The path itself, or any existing ancestor of it, is a symlink whose
///   target escapes the root.
pub fn validate_path(workspace_root: &Path, candidate: impl AsRef<Path>) -> Result<PathBuf> {
    let root = workspace_root
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("workspace root invalid: {err}")))?;

    let mut normalized = PathBuf::new();
    for component in candidate.as_ref().components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(AppError::PathViolation(format!(
                        "{} escapes the workspace",
                        candidate.as_ref().display()
                    )));
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::Normal(part) => normalized.push(part),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(AppError::PathViolation("empty file path".into()));
    }

    let absolute = root.join(normalized);

    let ancestor = deepest_existing(&absolute);
    let resolved = ancestor
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("cannot resolve path: {err}")))?;
    if !resolved.starts_with(&root) {
        return Err(AppError::PathViolation(format!(
            "{} resolves outside the workspace through a symlink",
            candidate.as_ref().display()
        )));
    }

    if ancestor == absolute.as_path() {
        Ok(resolved)
    } else {
        Ok(absolute)
    }
}

/// Longest prefix of `path` that exists on disk, counting dangling symlinks
/// as existing so that they fail resolution instead of being skipped.
fn deepest_existing(path: &Path) -> &Path {
    let mut current = path;
    while std::fs::symlink_metadata(current).is_err() {
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}

/// Atomically write `content` to `relative` beneath `workspace_root`.
///
/// Parent directories are created as needed; the content goes to a
/// temporary file in the target directory and is renamed into place.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if the path escapes the workspace and
/// `AppError::Io` on file-system failures.
pub fn write_file(workspace_root: &Path, relative: &str, content: &str) -> Result<PathBuf> {
    let target = validate_path(workspace_root, relative)?;

    let parent = target
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent directory", target.display())))?;
    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Io(format!(
            "failed to create parent directories for {}: {err}",
            target.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(content.as_bytes())
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.persist(&target)
        .map_err(|err| AppError::Io(format!("failed to persist {}: {err}", target.display())))?;

    debug!(path = %target.display(), bytes = content.len(), "wrote session file");
    Ok(target)
}

/// Write every uploaded file, stopping at the first failure.
///
/// Runs on the blocking pool.
///
/// # Errors
///
/// Propagates the first error from [`write_file`].
pub async fn write_files(
    workspace_root: PathBuf,
    files: BTreeMap<String, String>,
) -> Result<Vec<PathBuf>> {
    tokio::task::spawn_blocking(move || {
        files
            .iter()
            .map(|(relative, content)| write_file(&workspace_root, relative, content))
            .collect()
    })
    .await
    .map_err(|err| AppError::Io(format!("file writer task failed: {err}")))?
}
