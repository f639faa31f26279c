//! Model artifact selection.

use crate::error::{Result, WardenError};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

/// Pick the most recently modified file in `dir` whose name ends with `suffix`.
///
/// Only the directory itself is scanned, not subdirectories. A missing or
/// unreadable directory and a directory without matches both yield
/// [`WardenError::NoArtifactFound`].
pub fn resolve_latest_artifact(dir: &Path, suffix: &str) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(WardenError::NoArtifactFound {
            dir: dir.to_path_buf(),
        });
    }

    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let matches = entry
            .file_name()
            .to_str()
            .map(|name| name.ends_with(suffix))
            .unwrap_or(false);
        if !matches {
            continue;
        }

        let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(t) => t,
            None => continue,
        };

        let is_newer = newest
            .as_ref()
            .map(|(t, _)| modified > *t)
            .unwrap_or(true);
        if is_newer {
            newest = Some((modified, entry.into_path()));
        }
    }

    match newest {
        Some((_, path)) => {
            debug!("Latest artifact in {}: {}", dir.display(), path.display());
            Ok(path)
        }
        None => Err(WardenError::NoArtifactFound {
            dir: dir.to_path_buf(),
        }),
    }
}
