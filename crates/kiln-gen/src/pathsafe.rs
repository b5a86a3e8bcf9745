//! Output-root path containment
//!
//! Target manifests are untrusted input: output paths, edit bases, and
//! controlnet references must all resolve inside the run's output root
//! before any I/O happens. Escapes are fatal and never retried.

use kiln_core::{KilnError, Result};
use std::path::{Component, Path, PathBuf};

/// Resolve `candidate` against `root` and verify the result stays inside it.
///
/// Works lexically (no filesystem access), so it is safe to call for paths
/// that do not exist yet. Absolute candidates are accepted only when they
/// already sit under the root.
pub fn resolve_within_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let normalized_root = normalize(root);
    let normalized = normalize(&joined);

    if !normalized.starts_with(&normalized_root) {
        return Err(KilnError::PathSafety {
            path: candidate.to_path_buf(),
            root: root.to_path_buf(),
        });
    }
    Ok(normalized)
}

/// Lexically normalize a path: resolve `.` and `..` without touching the
/// filesystem. `..` at the top simply pops nothing, which `resolve_within_root`
/// then catches via the prefix check.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
