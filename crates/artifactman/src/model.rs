use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;

pub const IS_OWNED_URL: &str = "http://hl7.org/fhir/StructureDefinition/artifact-isOwned";
pub const RELEASE_LABEL_URL: &str = "http://hl7.org/fhir/StructureDefinition/artifact-releaseLabel";
pub const RELEASE_DESCRIPTION_URL: &str =
    "http://hl7.org/fhir/StructureDefinition/artifact-releaseDescription";
pub const KNOWLEDGE_CAPABILITY_URL: &str =
    "http://hl7.org/fhir/uv/cpg/StructureDefinition/cpg-knowledgeCapability";
pub const INTENDED_USAGE_CONTEXT_URL: &str =
    "http://hl7.org/fhir/uv/crmi/StructureDefinition/crmi-intendedUsageContext";
pub const DEPENDENCY_ROLE_URL: &str =
    "http://hl7.org/fhir/uv/crmi/StructureDefinition/crmi-dependencyRole";
pub const AUTHORITATIVE_SOURCE_URL: &str =
    "http://hl7.org/fhir/StructureDefinition/valueset-authoritativeSource";
pub const US_PH_USAGE_CONTEXT_SYSTEM: &str =
    "http://hl7.org/fhir/us/ecr/CodeSystem/us-ph-usage-context";
pub const PRIORITY_CODE: &str = "priority";
pub const CONDITION_CODE: &str = "focus";

/// Instant parsed from either a FHIR `date` (`2024-01-31`) or a `dateTime`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
pub struct FhirDateTime(DateTime<Utc>);

impl FhirDateTime {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn parse(raw: &str) -> Result<Self, ArtifactError> {
        let trimmed = raw.trim();
        if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(Self(instant.with_timezone(&Utc)));
        }
        NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Self(naive.and_utc()))
            .ok_or_else(|| ArtifactError::Validation(format!("invalid date '{trimmed}'")))
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for FhirDateTime {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

impl fmt::Display for FhirDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

impl Serialize for FhirDateTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FhirDateTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    #[default]
    Draft,
    Active,
    Retired,
    Unknown,
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ArtifactStatus::Draft => "draft",
            ArtifactStatus::Active => "active",
            ArtifactStatus::Retired => "retired",
            ArtifactStatus::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Related artifact type codes.
#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum RelationType {
    Documentation,
    Justification,
    Citation,
    Predecessor,
    Successor,
    DerivedFrom,
    DependsOn,
    ComposedOf,
}

impl RelationType {
    pub fn is_dependency_edge(self) -> bool {
        matches!(self, RelationType::DependsOn | RelationType::ComposedOf)
    }
}

/// Extension with a single polymorphic `value[x]` element kept as raw JSON.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Extension {
    pub url: String,
    #[serde(flatten)]
    pub value: Map<String, Value>,
}

impl Extension {
    pub fn with_value(url: impl Into<String>, kind: &str, value: Value) -> Self {
        let mut map = Map::new();
        map.insert(format!("value{kind}"), value);
        Self {
            url: url.into(),
            value: map,
        }
    }

    pub fn boolean(url: impl Into<String>, value: bool) -> Self {
        Self::with_value(url, "Boolean", Value::Bool(value))
    }

    pub fn string(url: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_value(url, "String", Value::String(value.into()))
    }

    pub fn code(url: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_value(url, "Code", Value::String(value.into()))
    }

    pub fn value_bool(&self) -> Option<bool> {
        self.value.get("valueBoolean").and_then(Value::as_bool)
    }

    /// First string-shaped `value[x]` (string, code, uri, canonical, markdown).
    pub fn value_str(&self) -> Option<&str> {
        ["valueString", "valueCode", "valueUri", "valueCanonical", "valueMarkdown", "valueUrl"]
            .iter()
            .find_map(|key| self.value.get(*key).and_then(Value::as_str))
    }

    pub fn value_usage_context(&self) -> Option<UsageContext> {
        self.value
            .get("valueUsageContext")
            .and_then(|raw| serde_json::from_value(raw.clone()).ok())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct Coding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    pub fn new(system: &str, code: &str) -> Self {
        Self {
            system: Some(system.into()),
            code: Some(code.into()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    pub fn first_code(&self) -> Option<&str> {
        self.coding.iter().find_map(|c| c.code.as_deref())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageContext {
    pub code: Coding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_codeable_concept: Option<CodeableConcept>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_reference: Option<Value>,
}

impl UsageContext {
    pub fn is_coded(&self, system: &str, code: &str) -> bool {
        self.code.system.as_deref() == Some(system) && self.code.code.as_deref() == Some(code)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Period {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<FhirDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<FhirDateTime>,
}

impl Period {
    pub fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelatedArtifact {
    #[serde(rename = "type")]
    pub relation: RelationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

impl RelatedArtifact {
    pub fn new(relation: RelationType, resource: impl Into<String>) -> Self {
        Self {
            relation,
            resource: Some(resource.into()),
            display: None,
            label: None,
            extension: Vec::new(),
        }
    }

    pub fn owned(mut self) -> Self {
        self.extension.push(Extension::boolean(IS_OWNED_URL, true));
        self
    }

    pub fn is_owned(&self) -> bool {
        self.extension
            .iter()
            .any(|ext| ext.url == IS_OWNED_URL && ext.value_bool() == Some(true))
    }

    pub fn reference(&self) -> Option<CanonicalReference> {
        self.resource
            .as_deref()
            .and_then(|raw| CanonicalReference::parse(raw).ok())
    }

    pub fn roles(&self) -> Vec<String> {
        dependency_roles(&self.extension)
    }
}

/// Roles declared with the dependency-role extension; `default` when none are present.
pub fn dependency_roles(extensions: &[Extension]) -> Vec<String> {
    let mut roles: Vec<String> = extensions
        .iter()
        .filter(|ext| ext.url == DEPENDENCY_ROLE_URL)
        .filter_map(|ext| ext.value_str().map(str::to_string))
        .collect();
    roles.sort();
    roles.dedup();
    if roles.is_empty() {
        roles.push("default".into());
    }
    roles
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Concept {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConceptSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concept: Vec<Concept>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_set: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Compose {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<ConceptSet>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct ExpansionParameter {
    pub name: String,
    #[serde(flatten)]
    pub value: Map<String, Value>,
}

impl ExpansionParameter {
    pub fn boolean(name: impl Into<String>, value: bool) -> Self {
        let mut map = Map::new();
        map.insert("valueBoolean".into(), Value::Bool(value));
        Self {
            name: name.into(),
            value: map,
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("valueString".into(), Value::String(value.into()));
        Self {
            name: name.into(),
            value: map,
        }
    }

    pub fn value_str(&self) -> Option<&str> {
        ["valueString", "valueUri", "valueCanonical", "valueCode"]
            .iter()
            .find_map(|key| self.value.get(*key).and_then(Value::as_str))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
pub struct ExpansionContains {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl ExpansionContains {
    /// Same system and code, and the same version when this entry pins one.
    pub fn matches(&self, other: &ExpansionContains) -> bool {
        self.system == other.system
            && self.code == other.code
            && (self.version.is_none() || self.version == other.version)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Expansion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<FhirDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter: Vec<ExpansionParameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contains: Vec<ExpansionContains>,
}

impl Expansion {
    pub fn is_naive(&self) -> bool {
        self.parameter.iter().any(|p| {
            p.name == "naive" && p.value.get("valueBoolean").and_then(Value::as_bool) == Some(true)
        })
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.parameter
            .iter()
            .filter(|p| p.name == "warning")
            .filter_map(ExpansionParameter::value_str)
            .filter(|w| !w.trim().is_empty())
    }

    pub fn has_string_parameter(&self, name: &str, value: &str) -> bool {
        self.parameter
            .iter()
            .any(|p| p.name == name && p.value_str() == Some(value))
    }

    /// Adds a code unless an equivalent entry is already present.
    pub fn add_code(&mut self, code: ExpansionContains) {
        if !self.contains.iter().any(|existing| code.matches(existing)) {
            self.contains.push(code);
        }
        self.total = Some(self.contains.len());
    }
}

/// Versioned knowledge artifact (Library, PlanDefinition, Measure, ValueSet, ...).
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeArtifact {
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub status: ArtifactStatus,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub experimental: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<FhirDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_date: Option<FhirDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_period: Option<Period>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub use_context: Vec<UsageContext>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_artifact: Vec<RelatedArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose: Option<Compose>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expansion: Option<Expansion>,
    /// Remaining resource elements, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl KnowledgeArtifact {
    pub fn new(resource_type: &str, url: &str, version: Option<&str>) -> Self {
        Self {
            resource_type: resource_type.into(),
            url: url.into(),
            version: version.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn canonical(&self) -> CanonicalReference {
        CanonicalReference::new(self.url.clone(), self.version.clone())
    }

    pub fn is_value_set(&self) -> bool {
        self.resource_type == "ValueSet"
    }

    /// Value-set references from `compose.include.valueSet`.
    pub fn value_set_includes(&self) -> Vec<String> {
        self.compose
            .iter()
            .flat_map(|compose| compose.include.iter())
            .flat_map(|include| include.value_set.iter().cloned())
            .collect()
    }

    /// A value set without nested value-set includes.
    pub fn is_leaf_value_set(&self) -> bool {
        self.is_value_set() && self.value_set_includes().is_empty()
    }

    pub fn is_grouper_value_set(&self) -> bool {
        self.is_value_set() && !self.value_set_includes().is_empty()
    }

    pub fn extension_by_url(&self, url: &str) -> Option<&Extension> {
        self.extension.iter().find(|ext| ext.url == url)
    }

    pub fn remove_extensions(&mut self, url: &str) {
        self.extension.retain(|ext| ext.url != url);
    }

    /// Replaces any extension with the same url.
    pub fn set_extension(&mut self, extension: Extension) {
        self.remove_extensions(&extension.url.clone());
        self.extension.push(extension);
    }

    /// `type` as a plain code: the string form for StructureDefinition, first coding otherwise.
    pub fn kind_code(&self) -> Option<String> {
        match self.kind.as_ref()? {
            Value::String(code) => Some(code.clone()),
            other => serde_json::from_value::<CodeableConcept>(other.clone())
                .ok()
                .and_then(|concept| concept.first_code().map(str::to_string)),
        }
    }

    pub fn has_true_extension_containing(&self, fragment: &str) -> bool {
        self.extension
            .iter()
            .any(|ext| ext.url.contains(fragment) && ext.value_bool() == Some(true))
    }

    pub fn priority(&self) -> Option<&str> {
        self.use_context
            .iter()
            .find(|uc| uc.is_coded(US_PH_USAGE_CONTEXT_SYSTEM, PRIORITY_CODE))
            .and_then(|uc| uc.value_codeable_concept.as_ref())
            .and_then(CodeableConcept::first_code)
    }

    pub fn conditions(&self) -> Vec<&Coding> {
        self.use_context
            .iter()
            .filter(|uc| uc.is_coded(US_PH_USAGE_CONTEXT_SYSTEM, CONDITION_CODE))
            .filter_map(|uc| uc.value_codeable_concept.as_ref())
            .flat_map(|concept| concept.coding.iter())
            .collect()
    }

    /// Human-readable label used in diagnostics.
    pub fn descriptor(&self) -> String {
        let label = self
            .title
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(self.url.as_str());
        match &self.version {
            Some(version) => format!("{} {label}, {version}", self.resource_type),
            None => format!("{} {label}", self.resource_type),
        }
    }
}

/// Review record produced by the approve operation.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Assessment {
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub artifact_canonical: String,
    pub information_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub date: FhirDateTime,
}
