//! Safe path resolution: every filesystem tool operation resolves through
//! here, and anything escaping the sandbox root is rejected before any
//! disk access.

use std::path::{Path, PathBuf};

/// Resolve `requested` inside `sandbox_dir`.
///
/// Leading slashes are stripped (absolute inputs are treated as
/// sandbox-relative), the path is resolved through the longest existing
/// prefix so symlinks cannot smuggle it out, and the result must still be
/// under the canonical sandbox root.
pub fn safe_path(sandbox_dir: &Path, requested: &str) -> Result<PathBuf, String> {
    let cleaned = requested.trim_start_matches('/');

    let root = sandbox_dir.canonicalize().map_err(|e| {
        format!(
            "Security Error: sandbox root '{}' is unavailable: {e}",
            sandbox_dir.display()
        )
    })?;

    let candidate = root.join(cleaned);

    // Canonicalize the target if it exists; otherwise canonicalize the
    // nearest existing ancestor and re-append the tail.
    let resolved = if candidate.exists() {
        candidate
            .canonicalize()
            .map_err(|e| format!("Security Error: cannot resolve '{requested}': {e}"))?
    } else {
        let mut existing = candidate.as_path();
        let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
        while !existing.exists() {
            match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name);
                    existing = parent;
                }
                _ => break,
            }
        }
        let mut resolved = existing
            .canonicalize()
            .map_err(|e| format!("Security Error: cannot resolve '{requested}': {e}"))?;
        for part in tail.into_iter().rev() {
            resolved.push(part);
        }
        resolved
    };

    if !resolved.starts_with(&root) {
        return Err(format!(
            "Security Error: Path '{requested}' attempts to access outside sandbox."
        ));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_relative_paths_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let p = safe_path(dir.path(), "notes/today.txt").unwrap();
        assert!(p.starts_with(dir.path().canonicalize().unwrap()));
        assert!(p.ends_with("notes/today.txt"));
    }

    #[test]
    fn absolute_inputs_are_rebased() {
        let dir = tempfile::tempdir().unwrap();
        let p = safe_path(dir.path(), "/etc/passwd").unwrap();
        assert!(p.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn dotdot_escape_is_rejected() {
        // The resolved absolute path must stay under the sandbox root.
        let dir = tempfile::tempdir().unwrap();
        let err = safe_path(dir.path(), "../../etc/passwd").unwrap_err();
        assert!(err.contains("Security Error"));

        let err = safe_path(dir.path(), "a/../../../b").unwrap_err();
        assert!(err.contains("Security Error"));
    }

    #[test]
    fn interior_dotdot_that_stays_inside_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        let p = safe_path(dir.path(), "a/../file.txt").unwrap();
        assert!(p.ends_with("file.txt"));
        assert!(p.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn symlink_escape_is_rejected() {
        let sandbox = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(outside.path(), sandbox.path().join("leak")).unwrap();
            let err = safe_path(sandbox.path(), "leak/secret.txt").unwrap_err();
            assert!(err.contains("Security Error"));
        }
    }
}
