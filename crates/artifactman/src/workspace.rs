use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::config::{CONFIG_FILE_NAME, WorkspaceConfig};
use crate::error::ArtifactError;

pub const DOT_DIR: &str = ".artifactman";

/// Canonical paths for an artifact workspace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspacePaths {
    root: PathBuf,
    dot_dir: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: PathBuf, dot_dir: PathBuf) -> Self {
        Self { root, dot_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the `.artifactman` folder for this workspace.
    pub fn dot_dir(&self) -> &Path {
        &self.dot_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.dot_dir.join(CONFIG_FILE_NAME)
    }

    pub fn load_config(&self) -> Result<WorkspaceConfig, ArtifactError> {
        WorkspaceConfig::load(&self.config_file())
    }
}

pub trait WorkspaceLocator: Send + Sync {
    fn workspace(&self) -> Result<WorkspacePaths, ArtifactError>;
}

/// Filesystem-backed workspace locator that re-validates its cached result.
pub struct FilesystemWorkspaceLocator {
    start: PathBuf,
    cache: Mutex<Option<WorkspacePaths>>,
}

impl FilesystemWorkspaceLocator {
    pub fn new(start: impl Into<PathBuf>) -> Self {
        Self {
            start: start.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn from_current_dir() -> Result<Self, ArtifactError> {
        Ok(Self::new(env::current_dir()?))
    }
}

impl WorkspaceLocator for FilesystemWorkspaceLocator {
    fn workspace(&self) -> Result<WorkspacePaths, ArtifactError> {
        let mut cache = self.cache.lock();
        if let Some(paths) = cache.as_ref() {
            if paths.root().is_dir() && paths.dot_dir().is_dir() {
                return Ok(paths.clone());
            }
        }
        let discovered = discover(&self.start)?;
        *cache = Some(discovered.clone());
        Ok(discovered)
    }
}

/// Finds the nearest ancestor of `start` holding a `.artifactman` directory.
pub fn discover(start: impl AsRef<Path>) -> Result<WorkspacePaths, ArtifactError> {
    let canonical_start = normalize_start(start.as_ref())?;

    for ancestor in canonical_start.ancestors() {
        let candidate = ancestor.join(DOT_DIR);
        if candidate.is_dir() {
            return Ok(WorkspacePaths::new(ancestor.to_path_buf(), candidate));
        }
    }

    Err(ArtifactError::Workspace(format!(
        "no {DOT_DIR} directory found from {}",
        canonical_start.display()
    )))
}

/// Creates `.artifactman/config.yaml` and the artifacts directory under `root`.
///
/// An existing config is left untouched.
pub fn init(root: impl AsRef<Path>, config: &WorkspaceConfig) -> Result<WorkspacePaths, ArtifactError> {
    let root = root.as_ref();
    fs::create_dir_all(root)?;
    let root = fs::canonicalize(root)?;
    let paths = WorkspacePaths::new(root.clone(), root.join(DOT_DIR));
    fs::create_dir_all(paths.dot_dir())?;

    let config_file = paths.config_file();
    let effective = if config_file.is_file() {
        tracing::info!(path = %config_file.display(), "workspace already initialized");
        paths.load_config()?
    } else {
        config.save(&config_file)?;
        config.clone()
    };
    fs::create_dir_all(effective.artifacts_path(paths.root()))?;
    Ok(paths)
}

fn normalize_start(start: &Path) -> Result<PathBuf, ArtifactError> {
    let mut cursor = start.to_path_buf();

    while !cursor.exists() {
        if !cursor.pop() {
            return Err(ArtifactError::Workspace(format!(
                "unable to find existing ancestor for {}",
                start.display()
            )));
        }
    }

    if cursor.is_file() {
        cursor = cursor.parent().map(Path::to_path_buf).ok_or_else(|| {
            ArtifactError::Workspace(format!("file path {} has no parent directory", start.display()))
        })?;
    }

    Ok(fs::canonicalize(cursor)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::SchemaVersion;
    use tempfile::tempdir;

    #[test]
    fn discover_locates_nearest_workspace() {
        let temp = tempdir().unwrap();
        let root = temp.path().join("content");
        fs::create_dir_all(root.join(DOT_DIR)).unwrap();
        fs::create_dir_all(root.join("artifacts").join("valuesets")).unwrap();

        let paths = discover(root.join("artifacts").join("valuesets")).unwrap();
        let expected = root.canonicalize().unwrap();
        assert_eq!(paths.root(), expected.as_path());
        assert_eq!(paths.dot_dir(), expected.join(DOT_DIR).as_path());
    }

    #[test]
    fn discover_tolerates_missing_leaf_paths() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join(DOT_DIR)).unwrap();
        let paths = discover(temp.path().join("not").join("yet").join("created.json")).unwrap();
        assert_eq!(paths.root(), temp.path().canonicalize().unwrap().as_path());
    }

    #[test]
    fn discover_errors_without_dot_dir() {
        let temp = tempdir().unwrap();
        let err = discover(temp.path()).expect_err("no workspace");
        assert!(matches!(err, ArtifactError::Workspace(_)));
    }

    #[test]
    fn init_writes_config_once() {
        let temp = tempdir().unwrap();
        let config = WorkspaceConfig {
            schema_version: SchemaVersion::R5,
            ..Default::default()
        };
        let paths = init(temp.path(), &config).unwrap();
        assert!(paths.root().join("artifacts").is_dir());
        assert_eq!(paths.load_config().unwrap().schema_version, SchemaVersion::R5);

        init(temp.path(), &WorkspaceConfig::default()).unwrap();
        assert_eq!(paths.load_config().unwrap().schema_version, SchemaVersion::R5);
    }

    #[test]
    fn locator_revalidates_cache() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join(DOT_DIR)).unwrap();
        let locator = FilesystemWorkspaceLocator::new(temp.path().join("sub"));
        let first = locator.workspace().unwrap();
        fs::remove_dir_all(first.dot_dir()).unwrap();
        let err = locator.workspace().expect_err("dot dir removed");
        assert!(matches!(err, ArtifactError::Workspace(_)));
    }
}
