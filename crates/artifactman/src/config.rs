use std::fs;
use std::path::{Path, PathBuf};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::artifact::SchemaVersion;
use crate::error::ArtifactError;
use crate::params::TerminologyEndpoint;
use crate::terminology::TerminologySettings;

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TerminologyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<TerminologyEndpoint>,
    #[serde(flatten)]
    pub settings: TerminologySettings,
}

/// Contents of `.artifactman/config.yaml`.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub schema_version: SchemaVersion,
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
    #[serde(default)]
    pub terminology: TerminologyConfig,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            schema_version: SchemaVersion::default(),
            artifacts_dir: default_artifacts_dir(),
            terminology: TerminologyConfig::default(),
        }
    }
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from(DEFAULT_ARTIFACTS_DIR)
}

impl WorkspaceConfig {
    /// Reads the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "no workspace config, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|err| {
            ArtifactError::Workspace(format!("invalid config {}: {err}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Artifacts directory resolved against the workspace root.
    pub fn artifacts_path(&self, root: &Path) -> PathBuf {
        if self.artifacts_dir.is_absolute() {
            self.artifacts_dir.clone()
        } else {
            root.join(&self.artifacts_dir)
        }
    }
}

/// JSON schema for the config file, used by `artifactman schema`.
pub fn config_schema() -> schemars::Schema {
    schemars::schema_for!(WorkspaceConfig)
}
