use std::path::PathBuf;
use std::sync::Arc;

use artifactman::{
    ExpansionCache, FilesystemRepository, FilesystemWorkspaceLocator, HttpTerminologyProvider,
    LifecycleEngine, SchemaVersion, WorkspaceConfig, WorkspaceLocator, WorkspacePaths,
};

use crate::error::CliError;
use crate::util::Verbosity;

pub struct CliSession {
    pub workspace_paths: WorkspacePaths,
    pub config: WorkspaceConfig,
    pub terminology: Arc<HttpTerminologyProvider>,
    pub cache: ExpansionCache,
    // Owns the repository; every command reads and writes through it.
    pub lifecycle: LifecycleEngine<FilesystemRepository>,
    pub verbosity: Verbosity,
}

impl CliSession {
    pub fn bootstrap(
        workspace_override: Option<String>,
        schema_override: Option<SchemaVersion>,
        verbosity: Verbosity,
    ) -> Result<Self, CliError> {
        let locator = match workspace_override {
            Some(path) => FilesystemWorkspaceLocator::new(PathBuf::from(path)),
            None => FilesystemWorkspaceLocator::from_current_dir()?,
        };
        let workspace_paths = locator.workspace()?;

        let mut config = workspace_paths.load_config()?;
        if let Some(schema_version) = schema_override {
            config.schema_version = schema_version;
        }

        let repository = FilesystemRepository::open(
            config.artifacts_path(workspace_paths.root()),
            config.schema_version,
        )?;
        let terminology = Arc::new(HttpTerminologyProvider::new(
            config.terminology.settings.clone(),
        ));
        let cache = ExpansionCache::new();
        let lifecycle = LifecycleEngine::new(repository)
            .with_schema_version(config.schema_version)
            .with_terminology(terminology.clone())
            .with_cache_notifier(cache.notifier());

        Ok(Self {
            workspace_paths,
            config,
            terminology,
            cache,
            lifecycle,
            verbosity,
        })
    }

    pub fn repository(&self) -> &FilesystemRepository {
        self.lifecycle.repository()
    }
}
