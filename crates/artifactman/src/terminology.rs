use std::thread;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::bundle::Bundle;
use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;
use crate::model::{Expansion, ExpansionParameter, KnowledgeArtifact};
use crate::params::TerminologyEndpoint;
use crate::version::pin_latest;

/// Timeouts and retry policy for remote terminology calls.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct TerminologySettings {
    pub timeout_seconds: u64,
    pub socket_timeout_seconds: u64,
    pub max_retry_count: u32,
    pub retry_interval_millis: u64,
}

impl Default for TerminologySettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            socket_timeout_seconds: 60,
            max_retry_count: 3,
            retry_interval_millis: 1000,
        }
    }
}

/// Remote expansion and lookup service.
pub trait TerminologyProvider: Send + Sync {
    fn expand(
        &self,
        value_set: &KnowledgeArtifact,
        endpoint: &TerminologyEndpoint,
        parameters: &[ExpansionParameter],
    ) -> Result<Expansion, ArtifactError>;

    fn fetch_value_set(
        &self,
        reference: &CanonicalReference,
        endpoint: &TerminologyEndpoint,
    ) -> Result<Option<KnowledgeArtifact>, ArtifactError>;

    fn latest_version(
        &self,
        url: &str,
        endpoint: &TerminologyEndpoint,
    ) -> Result<Option<String>, ArtifactError>;
}

/// Username and API key, or the error naming which one is missing.
pub fn require_credentials<'a>(
    endpoint: &'a TerminologyEndpoint,
    value_set_url: &str,
) -> Result<(&'a str, &'a str), ArtifactError> {
    let username = endpoint
        .username
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            ArtifactError::unprocessable(format!(
                "Cannot expand ValueSet without VSAC Username: {value_set_url}"
            ))
        })?;
    let api_key = endpoint
        .api_key
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| {
            ArtifactError::unprocessable(format!(
                "Cannot expand ValueSet without VSAC API Key: {value_set_url}"
            ))
        })?;
    Ok((username, api_key))
}

/// Blocking FHIR terminology client with bounded retries.
pub struct HttpTerminologyProvider {
    agent: ureq::Agent,
    settings: TerminologySettings,
}

impl HttpTerminologyProvider {
    pub fn new(settings: TerminologySettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(settings.timeout_seconds))
            .timeout_read(Duration::from_secs(settings.socket_timeout_seconds))
            .timeout_write(Duration::from_secs(settings.socket_timeout_seconds))
            .build();
        Self { agent, settings }
    }

    pub fn settings(&self) -> &TerminologySettings {
        &self.settings
    }

    fn endpoint_url(
        &self,
        endpoint: &TerminologyEndpoint,
        segments: &[&str],
        query: &[(&str, &str)],
        value_set_url: &str,
    ) -> Result<Url, ArtifactError> {
        let mut url = Url::parse(endpoint.address.trim_end_matches('/')).map_err(|err| {
            ArtifactError::Validation(format!(
                "invalid terminology endpoint '{}': {err}",
                endpoint.address
            ))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                ArtifactError::Validation(format!(
                    "terminology endpoint '{}' cannot be a base url",
                    endpoint.address
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }

        let (username, api_key) = require_credentials(endpoint, value_set_url)?;
        url.set_username(username)
            .and_then(|_| url.set_password(Some(api_key)))
            .map_err(|_| {
                ArtifactError::Validation(format!(
                    "terminology endpoint '{}' does not accept credentials",
                    endpoint.address
                ))
            })?;
        Ok(url)
    }

    fn get_json(&self, url: &Url) -> Result<Value, ArtifactError> {
        let mut redacted = url.clone();
        let _ = redacted.set_password(None);
        let _ = redacted.set_username("");

        // One initial call plus `max_retry_count` retries.
        let attempts = self.settings.max_retry_count.saturating_add(1);
        let mut last_status = None;
        let mut diagnostics = Vec::new();
        for attempt in 1..=attempts {
            tracing::debug!(url = %redacted, attempt, "terminology request");
            match self
                .agent
                .request_url("GET", url)
                .set("Accept", "application/fhir+json")
                .call()
            {
                Ok(response) => {
                    let body = response.into_string()?;
                    return Ok(serde_json::from_str(&body)?);
                }
                Err(ureq::Error::Status(code @ (401 | 403), _)) => {
                    return Err(ArtifactError::upstream(
                        format!("Terminology Server rejected the supplied credentials ({code})"),
                        Some(code),
                        Vec::new(),
                    ));
                }
                Err(ureq::Error::Status(code, response)) => {
                    last_status = Some(code);
                    diagnostics.push(format!("{code} {}", response.status_text()));
                    if (400..500).contains(&code) && code != 429 {
                        break;
                    }
                }
                Err(ureq::Error::Transport(transport)) => {
                    diagnostics.push(transport.to_string());
                }
            }
            if attempt < attempts {
                thread::sleep(Duration::from_millis(self.settings.retry_interval_millis));
            }
        }
        tracing::warn!(url = %redacted, status = ?last_status, "terminology request failed");
        Err(ArtifactError::upstream(
            format!("Terminology Server request to '{redacted}' failed"),
            last_status,
            diagnostics,
        ))
    }

    fn search(
        &self,
        url: &str,
        version: Option<&str>,
        endpoint: &TerminologyEndpoint,
    ) -> Result<Vec<KnowledgeArtifact>, ArtifactError> {
        let mut query = vec![("url", url)];
        if let Some(version) = version {
            query.push(("version", version));
        }
        let request = self.endpoint_url(endpoint, &["ValueSet"], &query, url)?;
        let bundle: Bundle = serde_json::from_value(self.get_json(&request)?)?;
        Ok(bundle.artifacts().cloned().collect())
    }
}

impl TerminologyProvider for HttpTerminologyProvider {
    fn expand(
        &self,
        value_set: &KnowledgeArtifact,
        endpoint: &TerminologyEndpoint,
        parameters: &[ExpansionParameter],
    ) -> Result<Expansion, ArtifactError> {
        let mut query: Vec<(&str, &str)> = vec![("url", value_set.url.as_str())];
        if let Some(version) = value_set.version.as_deref() {
            query.push(("valueSetVersion", version));
        }
        for parameter in parameters {
            if let Some(value) = parameter.value_str() {
                query.push((parameter.name.as_str(), value));
            }
        }
        let request = self.endpoint_url(endpoint, &["ValueSet", "$expand"], &query, &value_set.url)?;
        let expanded: KnowledgeArtifact = serde_json::from_value(self.get_json(&request)?)?;
        expanded.expansion.ok_or_else(|| {
            ArtifactError::unprocessable(format!(
                "Terminology Server returned no expansion for ValueSet '{}'",
                value_set.url
            ))
        })
    }

    fn fetch_value_set(
        &self,
        reference: &CanonicalReference,
        endpoint: &TerminologyEndpoint,
    ) -> Result<Option<KnowledgeArtifact>, ArtifactError> {
        let found = self.search(reference.url(), reference.version(), endpoint)?;
        Ok(found.into_iter().next())
    }

    fn latest_version(
        &self,
        url: &str,
        endpoint: &TerminologyEndpoint,
    ) -> Result<Option<String>, ArtifactError> {
        let found = self.search(url, None, endpoint)?;
        Ok(pin_latest(found.iter().filter_map(|vs| vs.version.as_deref())))
    }
}
