use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;
use crate::expansion_cache::{CacheKey, ExpansionCache};
use crate::model::{
    Expansion, ExpansionContains, ExpansionParameter, FhirDateTime, KnowledgeArtifact,
};
use crate::params::TerminologyEndpoint;
use crate::repository::ArtifactRepository;
use crate::terminology::{TerminologyProvider, require_credentials};

/// Stable digest of the expansion parameters, independent of their order.
pub fn params_hash(parameters: &[ExpansionParameter]) -> String {
    let mut pairs: Vec<String> = parameters
        .iter()
        .map(|parameter| {
            let value = serde_json::Value::Object(parameter.value.clone());
            format!("{}={value}", parameter.name)
        })
        .collect();
    pairs.sort();

    let mut hasher = Sha256::new();
    for pair in &pairs {
        hasher.update(pair.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Union of the codes listed literally in `compose.include`, flagged `naive`.
pub fn naive_expansion(value_set: &KnowledgeArtifact) -> Expansion {
    let mut expansion = Expansion {
        timestamp: Some(FhirDateTime::now()),
        parameter: vec![ExpansionParameter::boolean("naive", true)],
        ..Default::default()
    };
    for include in value_set.compose.iter().flat_map(|c| c.include.iter()) {
        for concept in &include.concept {
            expansion.add_code(ExpansionContains {
                system: include.system.clone(),
                version: include.version.clone(),
                code: concept.code.clone(),
                display: concept.display.clone(),
            });
        }
    }
    expansion.total = Some(expansion.contains.len());
    expansion
}

/// Adds `warning` parameters for requested versions the server did not honor.
pub fn validate_expansion_parameters(expansion: &mut Expansion, requested: &[ExpansionParameter]) {
    for parameter in requested {
        let name = parameter.name.as_str();
        if name != "system-version" && name != "valueset-version" {
            continue;
        }
        let Some(value) = parameter.value_str() else {
            continue;
        };
        let honored = expansion.has_string_parameter(name, value)
            || expansion.has_string_parameter(&format!("used-{name}"), value);
        if !honored {
            expansion.parameter.push(ExpansionParameter::string(
                "warning",
                format!("Expansion did not honor requested {name} '{value}'"),
            ));
        }
    }
}

/// Expands value sets through the cache, the terminology provider, or naively.
pub struct ValueSetExpander<'a, R: ArtifactRepository + ?Sized> {
    repository: &'a R,
    cache: &'a ExpansionCache,
    provider: Option<&'a dyn TerminologyProvider>,
    endpoint: Option<&'a TerminologyEndpoint>,
    parameters: Vec<ExpansionParameter>,
}

impl<'a, R: ArtifactRepository + ?Sized> ValueSetExpander<'a, R> {
    pub fn new(repository: &'a R, cache: &'a ExpansionCache) -> Self {
        Self {
            repository,
            cache,
            provider: None,
            endpoint: None,
            parameters: Vec::new(),
        }
    }

    pub fn with_provider(
        mut self,
        provider: &'a dyn TerminologyProvider,
        endpoint: Option<&'a TerminologyEndpoint>,
    ) -> Self {
        self.provider = Some(provider);
        self.endpoint = endpoint;
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<ExpansionParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Expands `value_set`, looking children up in `local` before the repository and provider.
    pub fn expand(
        &self,
        value_set: &KnowledgeArtifact,
        local: &HashMap<CanonicalReference, KnowledgeArtifact>,
    ) -> Result<Expansion, ArtifactError> {
        let mut visiting = Vec::new();
        self.expand_inner(value_set, local, &mut visiting)
    }

    fn expand_inner(
        &self,
        value_set: &KnowledgeArtifact,
        local: &HashMap<CanonicalReference, KnowledgeArtifact>,
        visiting: &mut Vec<CanonicalReference>,
    ) -> Result<Expansion, ArtifactError> {
        let canonical = value_set.canonical();
        let key = CacheKey::new(canonical.clone(), params_hash(&self.parameters));
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(canonical = %canonical, "expansion cache hit");
            return Ok(cached);
        }
        if visiting.contains(&canonical) {
            return Err(ArtifactError::unprocessable(format!(
                "ValueSet '{}' includes itself",
                value_set.url
            )));
        }

        visiting.push(canonical.clone());
        let expansion = if value_set.is_grouper_value_set() {
            self.expand_grouper(value_set, local, visiting)
        } else {
            self.expand_leaf(value_set)
        };
        visiting.pop();
        let expansion = expansion?;

        if !expansion.is_naive() && self.cache.insert_if_absent(key, expansion.clone()) {
            tracing::debug!(canonical = %canonical, "cached expansion");
        }
        Ok(expansion)
    }

    fn expand_leaf(&self, value_set: &KnowledgeArtifact) -> Result<Expansion, ArtifactError> {
        match (self.provider, self.endpoint) {
            (Some(provider), Some(endpoint)) => {
                require_credentials(endpoint, &value_set.url)?;
                let mut expansion = provider.expand(value_set, endpoint, &self.parameters)?;
                validate_expansion_parameters(&mut expansion, &self.parameters);
                Ok(expansion)
            }
            _ => Ok(naive_expansion(value_set)),
        }
    }

    fn expand_grouper(
        &self,
        grouper: &KnowledgeArtifact,
        local: &HashMap<CanonicalReference, KnowledgeArtifact>,
        visiting: &mut Vec<CanonicalReference>,
    ) -> Result<Expansion, ArtifactError> {
        let mut union = Expansion {
            timestamp: Some(FhirDateTime::now()),
            ..Default::default()
        };
        let mut naive = false;
        for include in grouper.value_set_includes() {
            let child = self.find_child(grouper, &include, local)?;
            let expansion = self.expand_inner(&child, local, visiting)?;
            naive |= expansion.is_naive();
            for parameter in expansion.parameter.iter().filter(|p| p.name == "warning") {
                union.parameter.push(parameter.clone());
            }
            for code in expansion.contains {
                union.add_code(code);
            }
        }
        if naive {
            union.parameter.push(ExpansionParameter::boolean("naive", true));
        }
        union.total = Some(union.contains.len());
        Ok(union)
    }

    fn find_child(
        &self,
        grouper: &KnowledgeArtifact,
        include: &str,
        local: &HashMap<CanonicalReference, KnowledgeArtifact>,
    ) -> Result<KnowledgeArtifact, ArtifactError> {
        let missing = || {
            ArtifactError::unprocessable(format!(
                "Terminology Server expansion failed for ValueSet '{}' because Child ValueSet '{include}' could not be found.",
                grouper.url
            ))
        };
        let reference = CanonicalReference::parse(include).map_err(|_| missing())?;

        if let Some(found) = local.get(&reference).or_else(|| {
            local
                .values()
                .find(|candidate| reference.version().is_none() && candidate.canonical().same_url(&reference))
        }) {
            return Ok(found.clone());
        }
        if let Some(found) = self.repository.read(&reference)? {
            return Ok(found);
        }
        if let (Some(provider), Some(endpoint)) = (self.provider, self.endpoint) {
            if let Some(found) = provider.fetch_value_set(&reference, endpoint)? {
                tracing::debug!(reference = %reference, "fetched child value set from terminology server");
                return Ok(found);
            }
        }
        Err(missing())
    }
}
