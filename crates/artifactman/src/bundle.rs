use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::ArtifactError;
use crate::model::{Assessment, KnowledgeArtifact};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    #[default]
    Searchset,
    Collection,
    Transaction,
    TransactionResponse,
}

impl FromStr for BundleType {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "searchset" => Ok(BundleType::Searchset),
            "collection" => Ok(BundleType::Collection),
            "transaction" => Ok(BundleType::Transaction),
            other => Err(ArtifactError::Validation(format!(
                "Invalid bundleType '{other}'. Valid values are 'searchset', 'collection', 'transaction'."
            ))),
        }
    }
}

impl fmt::Display for BundleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BundleType::Searchset => "searchset",
            BundleType::Collection => "collection",
            BundleType::Transaction => "transaction",
            BundleType::TransactionResponse => "transaction-response",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    Post,
    Put,
    Delete,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntryRequest {
    pub method: HttpVerb,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,
}

/// Resource carried by a bundle entry, discriminated by `resourceType`.
#[derive(Clone, Debug, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum Resource {
    Assessment(Assessment),
    Artifact(KnowledgeArtifact),
}

const ASSESSMENT_TYPES: [&str; 2] = ["Basic", "ArtifactAssessment"];

impl Resource {
    pub fn resource_type(&self) -> &str {
        match self {
            Resource::Assessment(assessment) => &assessment.resource_type,
            Resource::Artifact(artifact) => &artifact.resource_type,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Resource::Assessment(assessment) => assessment.id.as_deref(),
            Resource::Artifact(artifact) => artifact.id.as_deref(),
        }
    }

    pub fn set_id(&mut self, id: String) {
        match self {
            Resource::Assessment(assessment) => assessment.id = Some(id),
            Resource::Artifact(artifact) => artifact.id = Some(id),
        }
    }

    pub fn as_artifact(&self) -> Option<&KnowledgeArtifact> {
        match self {
            Resource::Artifact(artifact) => Some(artifact),
            Resource::Assessment(_) => None,
        }
    }

    pub fn as_assessment(&self) -> Option<&Assessment> {
        match self {
            Resource::Assessment(assessment) => Some(assessment),
            Resource::Artifact(_) => None,
        }
    }
}

impl Serialize for Resource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Resource::Assessment(assessment) => assessment.serialize(serializer),
            Resource::Artifact(artifact) => artifact.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let resource_type = value
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if ASSESSMENT_TYPES.contains(&resource_type) {
            serde_json::from_value(value)
                .map(Resource::Assessment)
                .map_err(serde::de::Error::custom)
        } else {
            serde_json::from_value(value)
                .map(Resource::Artifact)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<EntryRequest>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
    Information,
}

/// Non-fatal diagnostic attached to a result bundle.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Issue {
    pub severity: IssueSeverity,
    pub code: String,
    pub diagnostics: String,
}

impl Issue {
    pub fn warning(diagnostics: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            code: "processing".into(),
            diagnostics: diagnostics.into(),
        }
    }

    pub fn error(diagnostics: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            code: "not-found".into(),
            diagnostics: diagnostics.into(),
        }
    }
}

fn bundle_resource_type() -> String {
    "Bundle".into()
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default = "bundle_resource_type")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: BundleType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<BundleEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issue: Vec<Issue>,
}

impl Bundle {
    pub fn new(kind: BundleType) -> Self {
        Self {
            resource_type: bundle_resource_type(),
            id: None,
            kind,
            total: None,
            entry: Vec::new(),
            issue: Vec::new(),
        }
    }

    pub fn transaction() -> Self {
        Self::new(BundleType::Transaction)
    }

    pub fn push_post(&mut self, resource: Resource) {
        let url = resource.resource_type().to_string();
        self.entry.push(BundleEntry {
            full_url: None,
            resource: Some(resource),
            request: Some(EntryRequest {
                method: HttpVerb::Post,
                url,
                if_none_exist: None,
            }),
        });
    }

    pub fn push_put(&mut self, resource: Resource) {
        let url = format!(
            "{}/{}",
            resource.resource_type(),
            resource.id().unwrap_or_default()
        );
        self.entry.push(BundleEntry {
            full_url: None,
            resource: Some(resource),
            request: Some(EntryRequest {
                method: HttpVerb::Put,
                url,
                if_none_exist: None,
            }),
        });
    }

    pub fn push_delete(&mut self, resource_type: &str, id: &str) {
        self.entry.push(BundleEntry {
            full_url: None,
            resource: None,
            request: Some(EntryRequest {
                method: HttpVerb::Delete,
                url: format!("{resource_type}/{id}"),
                if_none_exist: None,
            }),
        });
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &KnowledgeArtifact> {
        self.entry
            .iter()
            .filter_map(|entry| entry.resource.as_ref())
            .filter_map(Resource::as_artifact)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issue
            .iter()
            .filter(|issue| issue.severity == IssueSeverity::Warning)
    }
}
