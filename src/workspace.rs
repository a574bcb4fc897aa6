use std::path::PathBuf;

use thiserror::Error;

const MAX_PROJECT_ID_LEN: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceError {
    #[error("invalid project id '{0}'")]
    InvalidProjectId(String),
}

/// Maps a project to the working directory its sessions start in.
pub trait WorkspaceResolver: Send + Sync + 'static {
    fn resolve(&self, project_id: &str) -> Result<PathBuf, WorkspaceError>;
}

/// Resolves `<root>/<project_id>`. The directory is not required to exist;
/// a missing one surfaces as a spawn failure on the first `execute`.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl WorkspaceResolver for DirectoryResolver {
    fn resolve(&self, project_id: &str) -> Result<PathBuf, WorkspaceError> {
        validate_project_id(project_id)?;
        Ok(self.root.join(project_id))
    }
}

/// Reject ids that could escape the root or name something odd on disk.
pub fn validate_project_id(project_id: &str) -> Result<(), WorkspaceError> {
    let valid = !project_id.is_empty()
        && project_id.len() <= MAX_PROJECT_ID_LEN
        && project_id != "."
        && project_id != ".."
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WorkspaceError::InvalidProjectId(project_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_under_root() {
        let resolver = DirectoryResolver::new("/srv/ws");
        assert_eq!(resolver.resolve("my-app_2").unwrap(), PathBuf::from("/srv/ws/my-app_2"));
        assert_eq!(resolver.resolve("v1.2").unwrap(), PathBuf::from("/srv/ws/v1.2"));
    }

    #[test]
    fn rejects_traversal_and_separators() {
        let resolver = DirectoryResolver::new("/srv/ws");
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", "with space", "naïve"] {
            assert!(resolver.resolve(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn length_limit() {
        assert!(validate_project_id(&"a".repeat(128)).is_ok());
        assert_eq!(
            validate_project_id(&"a".repeat(129)),
            Err(WorkspaceError::InvalidProjectId("a".repeat(129)))
        );
    }
}
