//! Path validation for file tools.
//!
//! Model-supplied paths are resolved against the working directory,
//! normalized, and checked against forbidden locations (e.g. `~/.ssh`)
//! and, when configured, a set of allowed roots.

use std::path::{Component, Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path is empty")]
    Empty,

    #[error("Path '{path}' is outside allowed roots")]
    OutsideAllowedRoots { path: String },

    #[error("Path '{path}' is inside forbidden location '{pattern}'")]
    ForbiddenPath { path: String, pattern: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// Where file tools may go.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    forbidden: Vec<(String, PathBuf)>,
    allowed_roots: Vec<PathBuf>,
}

impl PathPolicy {
    /// Policy forbidding the given locations (`~` is expanded).
    pub fn new(forbidden: &[String]) -> Self {
        Self {
            forbidden: forbidden
                .iter()
                .map(|p| (p.clone(), normalize(&expand_tilde(p))))
                .collect(),
            allowed_roots: Vec::new(),
        }
    }

    /// Restrict access to paths under these roots. Empty allows all.
    ///
    /// Roots are resolved the same way as checked paths, so a root behind
    /// a symlink still matches.
    pub fn with_allowed_roots(mut self, roots: &[String]) -> Self {
        self.allowed_roots = roots
            .iter()
            .map(|r| {
                let root = normalize(&expand_tilde(r));
                canonicalize_existing(&root).unwrap_or(root)
            })
            .collect();
        self
    }

    /// Resolve `raw` relative to `cwd` and check it against the policy.
    ///
    /// The returned path is absolute with symlinks resolved for the part
    /// that exists on disk, so a file that is about to be created can be
    /// validated as well as an existing one.
    pub fn resolve(&self, cwd: &Path, raw: &str) -> Result<PathBuf, PathValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(PathValidationError::Empty);
        }

        let expanded = expand_tilde(trimmed);
        let joined = if expanded.is_absolute() {
            expanded
        } else {
            cwd.join(expanded)
        };
        let resolved = canonicalize_existing(&normalize(&joined)).map_err(|e| {
            PathValidationError::CanonicalizeFailed {
                path: raw.into(),
                reason: e.to_string(),
            }
        })?;

        for (pattern, forbidden) in &self.forbidden {
            if resolved.starts_with(forbidden) {
                return Err(PathValidationError::ForbiddenPath {
                    path: raw.into(),
                    pattern: pattern.clone(),
                });
            }
        }

        if !self.allowed_roots.is_empty()
            && !self.allowed_roots.iter().any(|root| resolved.starts_with(root))
        {
            return Err(PathValidationError::OutsideAllowedRoots { path: raw.into() });
        }

        Ok(resolved)
    }
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Canonicalize the longest existing ancestor and re-attach the rest.
fn canonicalize_existing(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                rest.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
    let mut resolved = existing.canonicalize()?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(home) = home_dir() {
        if path == "~" {
            return home;
        }
        if let Some(rest) = path.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let policy = PathPolicy::default();
        let resolved = policy.resolve(dir.path(), "a.txt").unwrap();
        assert_eq!(resolved, dir.path().canonicalize().unwrap().join("a.txt"));
    }

    #[test]
    fn missing_files_resolve_through_existing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let policy = PathPolicy::default();
        let resolved = policy.resolve(dir.path(), "new/dir/file.rs").unwrap();
        assert!(resolved.ends_with("new/dir/file.rs"));
        assert!(resolved.starts_with(dir.path().canonicalize().unwrap()));
    }

    #[test]
    fn dot_dot_is_normalized_before_checks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("project")).unwrap();
        let policy = PathPolicy::default().with_allowed_roots(&[root
            .join("project")
            .to_string_lossy()
            .into_owned()]);

        let err = policy
            .resolve(&root.join("project"), "../outside.txt")
            .unwrap_err();
        assert!(matches!(err, PathValidationError::OutsideAllowedRoots { .. }));
        assert!(policy.resolve(&root.join("project"), "src/../lib.rs").is_ok());
    }

    #[test]
    fn forbidden_path_blocked() {
        let policy = PathPolicy::new(&["/proc".into()]);
        let err = policy.resolve(Path::new("/"), "/proc/self/environ").unwrap_err();
        match err {
            PathValidationError::ForbiddenPath { pattern, .. } => assert_eq!(pattern, "/proc"),
            other => panic!("Expected ForbiddenPath, got: {other}"),
        }
    }

    #[test]
    fn forbidden_matches_whole_components() {
        let policy = PathPolicy::new(&["/tmp/secret".into()]);
        assert!(policy.resolve(Path::new("/"), "/tmp/secret/key").is_err());
        assert!(policy.resolve(Path::new("/"), "/tmp/secrets-not/file").is_ok());
    }

    #[test]
    fn forbidden_with_tilde_expansion() {
        if let Some(home) = home_dir() {
            let policy = PathPolicy::new(&["~/.ssh".into()]);
            let err = policy.resolve(&home, "~/.ssh/id_rsa");
            assert!(matches!(err, Err(PathValidationError::ForbiddenPath { .. })));
        }
    }

    #[test]
    fn empty_path_rejected() {
        let err = PathPolicy::default().resolve(Path::new("/"), "  ").unwrap_err();
        assert!(matches!(err, PathValidationError::Empty));
    }

    #[test]
    fn forbidden_takes_precedence_over_allowed() {
        let policy = PathPolicy::new(&["/home/user/.ssh".into()])
            .with_allowed_roots(&["/home/user".into()]);
        let result = policy.resolve(Path::new("/home/user"), ".ssh/id_rsa");
        assert!(matches!(result, Err(PathValidationError::ForbiddenPath { .. })));
    }
}
