use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;
use crate::model::{
    ArtifactStatus, Assessment, Extension, FhirDateTime, KnowledgeArtifact, Period, RelatedArtifact,
};

/// Capability surface the lifecycle engine needs from an artifact, independent of wire shape.
pub trait CanonicalArtifact {
    fn resource_type(&self) -> &str;
    fn id(&self) -> Option<&str>;
    fn set_id(&mut self, id: Option<String>);
    fn url(&self) -> &str;
    fn set_url(&mut self, url: String);
    fn version(&self) -> Option<&str>;
    fn set_version(&mut self, version: Option<String>);
    fn status(&self) -> ArtifactStatus;
    fn set_status(&mut self, status: ArtifactStatus);
    fn date(&self) -> Option<FhirDateTime>;
    fn set_date(&mut self, date: Option<FhirDateTime>);
    fn approval_date(&self) -> Option<FhirDateTime>;
    fn set_approval_date(&mut self, date: Option<FhirDateTime>);
    fn effective_period(&self) -> Option<&Period>;
    fn set_effective_period(&mut self, period: Option<Period>);
    fn is_experimental(&self) -> bool;
    fn related_artifacts(&self) -> &[RelatedArtifact];
    fn related_artifacts_mut(&mut self) -> &mut Vec<RelatedArtifact>;
    fn extensions(&self) -> &[Extension];
    fn extensions_mut(&mut self) -> &mut Vec<Extension>;

    fn canonical(&self) -> CanonicalReference {
        CanonicalReference::new(self.url().to_string(), self.version().map(str::to_string))
    }

    /// Owned related artifacts, in declaration order.
    fn owned_references(&self) -> Vec<CanonicalReference> {
        self.related_artifacts()
            .iter()
            .filter(|related| related.is_owned())
            .filter_map(RelatedArtifact::reference)
            .collect()
    }
}

impl CanonicalArtifact for KnowledgeArtifact {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: Option<String>) {
        self.id = id;
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn set_url(&mut self, url: String) {
        self.url = url;
    }

    fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    fn set_version(&mut self, version: Option<String>) {
        self.version = version;
    }

    fn status(&self) -> ArtifactStatus {
        self.status
    }

    fn set_status(&mut self, status: ArtifactStatus) {
        self.status = status;
    }

    fn date(&self) -> Option<FhirDateTime> {
        self.date
    }

    fn set_date(&mut self, date: Option<FhirDateTime>) {
        self.date = date;
    }

    fn approval_date(&self) -> Option<FhirDateTime> {
        self.approval_date
    }

    fn set_approval_date(&mut self, date: Option<FhirDateTime>) {
        self.approval_date = date;
    }

    fn effective_period(&self) -> Option<&Period> {
        self.effective_period.as_ref()
    }

    fn set_effective_period(&mut self, period: Option<Period>) {
        self.effective_period = period;
    }

    fn is_experimental(&self) -> bool {
        self.experimental
    }

    fn related_artifacts(&self) -> &[RelatedArtifact] {
        &self.related_artifact
    }

    fn related_artifacts_mut(&mut self) -> &mut Vec<RelatedArtifact> {
        &mut self.related_artifact
    }

    fn extensions(&self) -> &[Extension] {
        &self.extension
    }

    fn extensions_mut(&mut self) -> &mut Vec<Extension> {
        &mut self.extension
    }
}

/// Schema release an artifact workspace is authored against.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    Dstu3,
    #[default]
    R4,
    R5,
}

impl SchemaVersion {
    /// Codec translating this release's JSON into the engine model.
    pub fn codec(self) -> Box<dyn ArtifactCodec> {
        match self {
            SchemaVersion::Dstu3 => Box::new(Dstu3Codec),
            SchemaVersion::R4 => Box::new(R4Codec),
            SchemaVersion::R5 => Box::new(R5Codec),
        }
    }
}

impl FromStr for SchemaVersion {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dstu3" | "stu3" => Ok(SchemaVersion::Dstu3),
            "r4" => Ok(SchemaVersion::R4),
            "r5" => Ok(SchemaVersion::R5),
            other => Err(ArtifactError::Validation(format!(
                "unsupported schema version '{other}' (expected dstu3, r4 or r5)"
            ))),
        }
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SchemaVersion::Dstu3 => "dstu3",
            SchemaVersion::R4 => "r4",
            SchemaVersion::R5 => "r5",
        };
        f.write_str(label)
    }
}

pub trait ArtifactCodec: Send + Sync {
    fn schema_version(&self) -> SchemaVersion;
    fn decode(&self, value: Value) -> Result<KnowledgeArtifact, ArtifactError>;
    fn encode(&self, artifact: &KnowledgeArtifact) -> Result<Value, ArtifactError>;
    /// Resource type used for review records.
    fn assessment_type(&self) -> &'static str;

    fn encode_assessment(&self, assessment: &Assessment) -> Result<Value, ArtifactError> {
        let mut record = assessment.clone();
        record.resource_type = self.assessment_type().to_string();
        Ok(serde_json::to_value(record)?)
    }
}

fn decode_common(value: Value) -> Result<KnowledgeArtifact, ArtifactError> {
    let artifact: KnowledgeArtifact = serde_json::from_value(value)?;
    if artifact.resource_type.trim().is_empty() {
        return Err(ArtifactError::Serialization(
            "artifact is missing resourceType".into(),
        ));
    }
    Ok(artifact)
}

/// DSTU3 carries `relatedArtifact.resource` as a Reference object.
pub struct Dstu3Codec;

impl ArtifactCodec for Dstu3Codec {
    fn schema_version(&self) -> SchemaVersion {
        SchemaVersion::Dstu3
    }

    fn decode(&self, mut value: Value) -> Result<KnowledgeArtifact, ArtifactError> {
        if let Some(related) = value.get_mut("relatedArtifact").and_then(Value::as_array_mut) {
            for entry in related {
                let reference = entry
                    .get("resource")
                    .and_then(|resource| resource.get("reference"))
                    .cloned();
                if let (Some(reference), Some(object)) = (reference, entry.as_object_mut()) {
                    object.insert("resource".into(), reference);
                }
            }
        }
        decode_common(value)
    }

    fn encode(&self, artifact: &KnowledgeArtifact) -> Result<Value, ArtifactError> {
        let mut value = serde_json::to_value(artifact)?;
        if let Some(related) = value.get_mut("relatedArtifact").and_then(Value::as_array_mut) {
            for entry in related {
                if let Some(object) = entry.as_object_mut() {
                    if let Some(resource) = object.remove("resource") {
                        object.insert("resource".into(), serde_json::json!({ "reference": resource }));
                    }
                }
            }
        }
        Ok(value)
    }

    fn assessment_type(&self) -> &'static str {
        "Basic"
    }
}

pub struct R4Codec;

impl ArtifactCodec for R4Codec {
    fn schema_version(&self) -> SchemaVersion {
        SchemaVersion::R4
    }

    fn decode(&self, value: Value) -> Result<KnowledgeArtifact, ArtifactError> {
        decode_common(value)
    }

    fn encode(&self, artifact: &KnowledgeArtifact) -> Result<Value, ArtifactError> {
        Ok(serde_json::to_value(artifact)?)
    }

    fn assessment_type(&self) -> &'static str {
        "Basic"
    }
}

pub struct R5Codec;

impl ArtifactCodec for R5Codec {
    fn schema_version(&self) -> SchemaVersion {
        SchemaVersion::R5
    }

    fn decode(&self, value: Value) -> Result<KnowledgeArtifact, ArtifactError> {
        decode_common(value)
    }

    fn encode(&self, artifact: &KnowledgeArtifact) -> Result<Value, ArtifactError> {
        Ok(serde_json::to_value(artifact)?)
    }

    fn assessment_type(&self) -> &'static str {
        "ArtifactAssessment"
    }
}
