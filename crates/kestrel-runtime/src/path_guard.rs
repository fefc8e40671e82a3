use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathGuardError {
    #[error("workspace root must be an absolute path: {0}")]
    RootNotAbsolute(String),
    #[error("path `{0}` contains a `..` segment")]
    ParentSegment(String),
    #[error("path `{path}` escapes workspace `{root}`")]
    EscapesWorkspace { path: String, root: String },
}

/// Confines tool paths to one workspace root.
///
/// Resolution is purely lexical: no filesystem call is made, so a rejected
/// path is rejected before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PathGuardError> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(PathGuardError::RootNotAbsolute(root.display().to_string()));
        }
        let display = root.display().to_string();
        let root = normalize(&root).ok_or(PathGuardError::ParentSegment(display))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps `raw` to an absolute path inside the root. Empty input is the root
    /// itself, absolute input is taken as-is, relative input is joined onto
    /// the root.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, PathGuardError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(self.root.clone());
        }
        let candidate = Path::new(trimmed);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        let normalized =
            normalize(&joined).ok_or_else(|| PathGuardError::ParentSegment(trimmed.to_string()))?;
        // Component-wise: `/work/app2` does not start with `/work/app`.
        if normalized.starts_with(&self.root) {
            Ok(normalized)
        } else {
            Err(PathGuardError::EscapesWorkspace {
                path: trimmed.to_string(),
                root: self.root.display().to_string(),
            })
        }
    }

    /// Display form of an absolute path: relative to the root when inside it.
    pub fn rel(&self, abs: &Path) -> String {
        match abs.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => abs.display().to_string(),
        }
    }

    pub fn contains(&self, abs: &Path) -> bool {
        normalize(abs)
            .map(|p| p.starts_with(&self.root))
            .unwrap_or(false)
    }
}

/// Drops `.` components; returns `None` when any `..` is present.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => return None,
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}
