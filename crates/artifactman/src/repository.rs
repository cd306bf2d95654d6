use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::bundle::{Bundle, BundleEntry, BundleType, EntryRequest, HttpVerb, Resource};
use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;
use crate::ids;
use crate::model::KnowledgeArtifact;
use crate::version::compare_versions;

/// Storage contract the engine reads from and commits transactions into.
pub trait ArtifactRepository: Send + Sync {
    fn read_by_id(&self, resource_type: &str, id: &str) -> Result<Option<Resource>, ArtifactError>;
    /// Every stored version of the artifact with this url.
    fn search(&self, url: &str) -> Result<Vec<KnowledgeArtifact>, ArtifactError>;
    fn create(&self, resource: Resource) -> Result<Resource, ArtifactError>;
    fn update(&self, resource: Resource) -> Result<Resource, ArtifactError>;
    fn delete(&self, resource_type: &str, id: &str) -> Result<(), ArtifactError>;

    /// Exact version when the reference carries one, the latest stored version otherwise.
    fn read(&self, reference: &CanonicalReference) -> Result<Option<KnowledgeArtifact>, ArtifactError> {
        if reference.is_contained() {
            return Ok(None);
        }
        let candidates = self.search(reference.url_key())?;
        let found = match reference.version() {
            Some(version) => candidates
                .into_iter()
                .find(|artifact| artifact.version.as_deref() == Some(version)),
            None => candidates.into_iter().max_by(|a, b| {
                compare_versions(
                    a.version.as_deref().unwrap_or_default(),
                    b.version.as_deref().unwrap_or_default(),
                )
            }),
        };
        Ok(found)
    }

    /// Applies entries in order and returns a transaction-response bundle.
    fn transaction(&self, bundle: &Bundle) -> Result<Bundle, ArtifactError> {
        if bundle.kind != BundleType::Transaction {
            return Err(ArtifactError::Validation(format!(
                "expected a transaction bundle, got '{}'",
                bundle.kind
            )));
        }
        let mut response = Bundle::new(BundleType::TransactionResponse);
        for entry in &bundle.entry {
            response.entry.push(apply_entry(self, entry)?);
        }
        Ok(response)
    }
}

fn apply_entry<R: ArtifactRepository + ?Sized>(
    repository: &R,
    entry: &BundleEntry,
) -> Result<BundleEntry, ArtifactError> {
    let request = entry
        .request
        .as_ref()
        .ok_or_else(|| ArtifactError::Validation("transaction entry has no request".into()))?;
    let resource = match request.method {
        HttpVerb::Post => Some(repository.create(required_resource(entry)?)?),
        HttpVerb::Put => Some(repository.update(required_resource(entry)?)?),
        HttpVerb::Delete => {
            let (resource_type, id) = request.url.split_once('/').ok_or_else(|| {
                ArtifactError::Validation(format!("invalid delete url '{}'", request.url))
            })?;
            repository.delete(resource_type, id)?;
            None
        }
    };
    Ok(BundleEntry {
        full_url: resource
            .as_ref()
            .map(|r| format!("{}/{}", r.resource_type(), r.id().unwrap_or_default())),
        resource,
        request: Some(EntryRequest {
            method: request.method,
            url: request.url.clone(),
            if_none_exist: None,
        }),
    })
}

fn required_resource(entry: &BundleEntry) -> Result<Resource, ArtifactError> {
    entry
        .resource
        .clone()
        .ok_or_else(|| ArtifactError::Validation("transaction entry has no resource".into()))
}

type ResourceKey = (String, String);

/// Repository kept entirely in memory; transactions apply atomically.
#[derive(Default)]
pub struct InMemoryRepository {
    resources: RwLock<BTreeMap<ResourceKey, Resource>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifacts<I>(artifacts: I) -> Result<Self, ArtifactError>
    where
        I: IntoIterator<Item = KnowledgeArtifact>,
    {
        let repository = Self::new();
        for artifact in artifacts {
            repository.create(Resource::Artifact(artifact))?;
        }
        Ok(repository)
    }

    pub fn len(&self) -> usize {
        self.resources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.read().is_empty()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.resources.read().values().cloned().collect()
    }

    fn key(resource: &Resource) -> Result<ResourceKey, ArtifactError> {
        let id = resource
            .id()
            .ok_or_else(|| ArtifactError::Validation("resource has no id".into()))?;
        Ok((resource.resource_type().to_string(), id.to_string()))
    }

    fn with_id(mut resource: Resource) -> Result<Resource, ArtifactError> {
        if resource.id().is_none() {
            let id = match resource.as_artifact() {
                Some(artifact) => {
                    let reference = artifact.canonical();
                    ids::canonical_id(reference.tail(), reference.version())
                }
                None => ids::random_id()?,
            };
            resource.set_id(id);
        }
        Ok(resource)
    }
}

impl ArtifactRepository for InMemoryRepository {
    fn read_by_id(&self, resource_type: &str, id: &str) -> Result<Option<Resource>, ArtifactError> {
        Ok(self
            .resources
            .read()
            .get(&(resource_type.to_string(), id.to_string()))
            .cloned())
    }

    fn search(&self, url: &str) -> Result<Vec<KnowledgeArtifact>, ArtifactError> {
        let wanted = CanonicalReference::unversioned(url);
        Ok(self
            .resources
            .read()
            .values()
            .filter_map(Resource::as_artifact)
            .filter(|artifact| artifact.canonical().same_url(&wanted))
            .cloned()
            .collect())
    }

    fn create(&self, resource: Resource) -> Result<Resource, ArtifactError> {
        let resource = Self::with_id(resource)?;
        let key = Self::key(&resource)?;
        let mut guard = self.resources.write();
        if guard.contains_key(&key) {
            return Err(ArtifactError::Precondition(format!(
                "{}/{} already exists",
                key.0, key.1
            )));
        }
        guard.insert(key, resource.clone());
        Ok(resource)
    }

    fn update(&self, resource: Resource) -> Result<Resource, ArtifactError> {
        let key = Self::key(&resource)?;
        self.resources.write().insert(key, resource.clone());
        Ok(resource)
    }

    fn delete(&self, resource_type: &str, id: &str) -> Result<(), ArtifactError> {
        self.resources
            .write()
            .remove(&(resource_type.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| ArtifactError::NotFound(format!("{resource_type}/{id}")))
    }

    fn transaction(&self, bundle: &Bundle) -> Result<Bundle, ArtifactError> {
        let staged = InMemoryRepository {
            resources: RwLock::new(self.resources.read().clone()),
        };
        let mut response = Bundle::new(BundleType::TransactionResponse);
        if bundle.kind != BundleType::Transaction {
            return Err(ArtifactError::Validation(format!(
                "expected a transaction bundle, got '{}'",
                bundle.kind
            )));
        }
        for entry in &bundle.entry {
            response.entry.push(apply_entry(&staged, entry)?);
        }
        *self.resources.write() = staged.resources.into_inner();
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library(version: &str) -> KnowledgeArtifact {
        KnowledgeArtifact::new("Library", "http://ex.org/Library/lib", Some(version))
    }

    #[test]
    fn read_resolves_exact_and_latest_versions() {
        let repository =
            InMemoryRepository::with_artifacts([library("1.2.0"), library("1.10.0")]).unwrap();

        let exact = repository
            .read(&CanonicalReference::parse("http://ex.org/Library/lib|1.2.0").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(exact.version.as_deref(), Some("1.2.0"));

        let latest = repository
            .read(&CanonicalReference::unversioned("http://ex.org/Library/lib/"))
            .unwrap()
            .unwrap();
        assert_eq!(latest.version.as_deref(), Some("1.10.0"));

        let missing = repository
            .read(&CanonicalReference::parse("http://ex.org/Library/lib|9").unwrap())
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn create_assigns_canonical_ids() {
        let repository = InMemoryRepository::new();
        let created = repository.create(Resource::Artifact(library("1.0.0"))).unwrap();
        assert_eq!(created.id(), Some("lib-1.0.0"));

        let err = repository
            .create(Resource::Artifact(library("1.0.0")))
            .expect_err("duplicate id");
        assert!(matches!(err, ArtifactError::Precondition(_)));
    }

    #[test]
    fn failed_transaction_leaves_repository_untouched() {
        let repository = InMemoryRepository::with_artifacts([library("1.0.0")]).unwrap();
        let mut bundle = Bundle::transaction();
        bundle.push_post(Resource::Artifact(library("2.0.0")));
        bundle.push_delete("Library", "missing");

        let err = repository.transaction(&bundle).expect_err("missing delete target");
        assert!(matches!(err, ArtifactError::NotFound(_)));
        assert_eq!(repository.len(), 1);
    }

    #[test]
    fn transaction_applies_every_entry() {
        let repository = InMemoryRepository::with_artifacts([library("1.0.0")]).unwrap();
        let mut bundle = Bundle::transaction();
        bundle.push_post(Resource::Artifact(library("2.0.0")));
        bundle.push_delete("Library", "lib-1.0.0");

        let response = repository.transaction(&bundle).unwrap();
        assert_eq!(response.kind, BundleType::TransactionResponse);
        assert_eq!(response.entry.len(), 2);
        let remaining = repository.search("http://ex.org/Library/lib").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version.as_deref(), Some("2.0.0"));
    }
}
