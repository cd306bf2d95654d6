use artifactman::{Bundle, ChangeLog, IssueSeverity, KnowledgeArtifact};
use serde::Serialize;

use crate::error::ExitStatus;

pub mod diff;
pub mod graph;
pub mod init;
pub mod lifecycle;
pub mod package;
pub mod schema;

/// One-line identity of an artifact for command output.
#[derive(Clone, Debug, Serialize)]
pub struct ArtifactSummary {
    pub resource_type: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ArtifactSummary {
    pub fn of(artifact: &KnowledgeArtifact) -> Self {
        Self {
            resource_type: artifact.resource_type.clone(),
            url: artifact.url.clone(),
            version: artifact.version.clone(),
            status: artifact.status.to_string(),
            id: artifact.id.clone(),
        }
    }

    pub fn label(&self) -> String {
        match &self.version {
            Some(version) => format!("{} {}|{} ({})", self.resource_type, self.url, version, self.status),
            None => format!("{} {} ({})", self.resource_type, self.url, self.status),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandResult {
    WorkspaceInitialized {
        root: String,
        dot_dir: String,
        artifacts_dir: String,
        created: bool,
        dry_run: bool,
    },
    ConfigSchema {
        schema: serde_json::Value,
    },
    Graph {
        root: String,
        nodes: Vec<graph::NodeSummary>,
        edges: Vec<graph::EdgeSummary>,
        unresolved: Vec<String>,
    },
    Lifecycle {
        operation: String,
        root: ArtifactSummary,
        changes: Vec<lifecycle::ChangeSummary>,
        warnings: Vec<String>,
        dry_run: bool,
    },
    Package {
        bundle: Bundle,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    Diff {
        changelog: ChangeLog,
        format: String,
        #[serde(skip)]
        document: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
}

impl CommandResult {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            CommandResult::Package { bundle, .. } => {
                if bundle
                    .issue
                    .iter()
                    .any(|issue| issue.severity == IssueSeverity::Error)
                {
                    ExitStatus::Data
                } else {
                    ExitStatus::Ok
                }
            }
            CommandResult::Graph { unresolved, .. } if !unresolved.is_empty() => ExitStatus::Data,
            _ => ExitStatus::Ok,
        }
    }
}
