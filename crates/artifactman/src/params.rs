use std::collections::BTreeMap;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;

pub const VSAC_USERNAME_URL: &str = "http://hl7.org/fhir/StructureDefinition/cqf-vsacUsername";
pub const API_KEY_URL: &str = "http://hl7.org/fhir/StructureDefinition/cqf-apiKey";

/// Remote terminology service address and credentials.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TerminologyEndpoint {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl TerminologyEndpoint {
    /// Reads an Endpoint resource carrying credential extensions.
    pub fn from_endpoint_resource(resource: &Value) -> Result<Self, ArtifactError> {
        let address = resource
            .get("address")
            .and_then(Value::as_str)
            .filter(|address| !address.trim().is_empty())
            .ok_or_else(|| {
                ArtifactError::Validation("terminologyEndpoint requires an address".into())
            })?;
        let extension = |url: &str| {
            resource
                .get("extension")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .find(|ext| ext.get("url").and_then(Value::as_str) == Some(url))
                .and_then(|ext| ext.get("valueString"))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Ok(Self {
            address: address.to_string(),
            username: extension(VSAC_USERNAME_URL),
            api_key: extension(API_KEY_URL),
        })
    }
}

/// Named, repeatable operation arguments.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ParameterMap {
    values: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint: Option<TerminologyEndpoint>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.push(name, value);
        self
    }

    pub fn push(&mut self, name: &str, value: impl Into<String>) {
        self.values
            .entry(name.to_string())
            .or_default()
            .push(value.into());
    }

    pub fn set_endpoint(&mut self, endpoint: TerminologyEndpoint) {
        self.endpoint = Some(endpoint);
    }

    pub fn endpoint(&self) -> Option<&TerminologyEndpoint> {
        self.endpoint.as_ref()
    }

    /// Parses a FHIR `Parameters` resource.
    pub fn from_parameters_resource(resource: &Value) -> Result<Self, ArtifactError> {
        let mut map = Self::new();
        let parameters = resource
            .get("parameter")
            .and_then(Value::as_array)
            .into_iter()
            .flatten();
        for parameter in parameters {
            let name = parameter
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| ArtifactError::Validation("parameter without a name".into()))?;
            if name == "terminologyEndpoint" {
                if let Some(resource) = parameter.get("resource") {
                    map.set_endpoint(TerminologyEndpoint::from_endpoint_resource(resource)?);
                    continue;
                }
            }
            let value = parameter
                .as_object()
                .into_iter()
                .flatten()
                .find(|(key, _)| key.starts_with("value"))
                .map(|(_, value)| value);
            match value {
                Some(Value::String(text)) => map.push(name, text.clone()),
                Some(Value::Bool(flag)) => map.push(name, flag.to_string()),
                Some(Value::Number(number)) => map.push(name, number.to_string()),
                Some(other) => {
                    return Err(ArtifactError::Validation(format!(
                        "parameter '{name}' has an unsupported value {other}"
                    )));
                }
                None => {
                    return Err(ArtifactError::Validation(format!(
                        "parameter '{name}' has no value"
                    )));
                }
            }
        }
        Ok(map)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.values
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn strings(&self, name: &str) -> Vec<String> {
        self.values.get(name).cloned().unwrap_or_default()
    }

    pub fn boolean(&self, name: &str) -> Result<Option<bool>, ArtifactError> {
        self.string(name)
            .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(ArtifactError::Validation(format!(
                    "parameter '{name}' expects a boolean, got '{other}'"
                ))),
            })
            .transpose()
    }

    pub fn integer(&self, name: &str) -> Result<Option<i64>, ArtifactError> {
        self.string(name)
            .map(|raw| {
                raw.trim().parse::<i64>().map_err(|_| {
                    ArtifactError::Validation(format!(
                        "parameter '{name}' expects an integer, got '{raw}'"
                    ))
                })
            })
            .transpose()
    }

    /// Parses a coded parameter through its `FromStr` impl.
    pub fn code<T>(&self, name: &str) -> Result<Option<T>, ArtifactError>
    where
        T: FromStr<Err = ArtifactError>,
    {
        self.string(name).map(str::parse).transpose()
    }

    pub fn canonicals(&self, name: &str) -> Result<Vec<CanonicalReference>, ArtifactError> {
        self.values
            .get(name)
            .into_iter()
            .flatten()
            .map(|raw| CanonicalReference::parse(raw))
            .collect()
    }
}
