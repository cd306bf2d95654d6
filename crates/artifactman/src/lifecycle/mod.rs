//! Lifecycle state transitions over an artifact and its owned components.
//!
//! Every operation is planned against a snapshot of the repository and returned as a
//! [`LifecycleOutcome`] whose `mutations` bundle is applied with [`LifecycleEngine::commit`].

mod approve;
mod draft;
mod release;
mod transitions;

use std::collections::HashSet;
use std::sync::Arc;

use crate::artifact::{CanonicalArtifact, SchemaVersion};
use crate::bundle::{Bundle, HttpVerb};
use crate::canonical::CanonicalReference;
use crate::dependency_graph::{DependencyGraph, DependencyGraphWalker, WalkOptions};
use crate::error::ArtifactError;
use crate::expansion_cache::{CacheNotifier, ResourceChange};
use crate::model::KnowledgeArtifact;
use crate::params::ParameterMap;
use crate::repository::ArtifactRepository;
use crate::terminology::{HttpTerminologyProvider, TerminologyProvider, TerminologySettings};

pub use approve::{ASSESSMENT_TYPES, ApproveParams};
pub use draft::DraftParams;
pub use release::{ExperimentalPolicy, ReleaseParams};
pub use transitions::Transition;

/// Closed set of lifecycle actions.
#[derive(Clone, Debug)]
pub enum Operation {
    Release(ReleaseParams),
    Draft(DraftParams),
    Approve(ApproveParams),
    Retire,
    Withdraw,
    Delete,
}

impl Operation {
    /// Builds an operation from its name (`$release`, `draft`, ...) and arguments.
    pub fn from_parameters(name: &str, params: &ParameterMap) -> Result<Self, ArtifactError> {
        match name.trim_start_matches('$').to_ascii_lowercase().as_str() {
            "release" => Ok(Operation::Release(ReleaseParams::from_parameters(params)?)),
            "draft" => Ok(Operation::Draft(DraftParams::from_parameters(params)?)),
            "approve" => Ok(Operation::Approve(ApproveParams::from_parameters(params)?)),
            "retire" => Ok(Operation::Retire),
            "withdraw" => Ok(Operation::Withdraw),
            "delete" => Ok(Operation::Delete),
            other => Err(ArtifactError::Validation(format!(
                "unknown lifecycle operation '{other}'"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Release(_) => "release",
            Operation::Draft(_) => "draft",
            Operation::Approve(_) => "approve",
            Operation::Retire => "retire",
            Operation::Withdraw => "withdraw",
            Operation::Delete => "delete",
        }
    }
}

/// Planned result of an operation: the updated root plus the transaction that persists it.
#[derive(Clone, Debug)]
pub struct LifecycleOutcome {
    pub root: KnowledgeArtifact,
    pub mutations: Bundle,
    pub warnings: Vec<String>,
}

pub struct LifecycleEngine<R: ArtifactRepository> {
    repository: R,
    schema_version: SchemaVersion,
    terminology: Arc<dyn TerminologyProvider>,
    notifier: Option<CacheNotifier>,
}

impl<R: ArtifactRepository> LifecycleEngine<R> {
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            schema_version: SchemaVersion::default(),
            terminology: Arc::new(HttpTerminologyProvider::new(TerminologySettings::default())),
            notifier: None,
        }
    }

    pub fn with_schema_version(mut self, schema_version: SchemaVersion) -> Self {
        self.schema_version = schema_version;
        self
    }

    pub fn with_terminology(mut self, terminology: Arc<dyn TerminologyProvider>) -> Self {
        self.terminology = terminology;
        self
    }

    /// Committed changes are reported to the expansion cache behind `notifier`.
    pub fn with_cache_notifier(mut self, notifier: CacheNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn into_repository(self) -> R {
        self.repository
    }

    pub fn apply(
        &self,
        root: &CanonicalReference,
        operation: Operation,
    ) -> Result<LifecycleOutcome, ArtifactError> {
        tracing::debug!(root = %root, operation = operation.name(), "planning lifecycle operation");
        match operation {
            Operation::Release(params) => release::release(self, root, &params),
            Operation::Draft(params) => draft::draft(self, root, &params),
            Operation::Approve(params) => approve::approve(self, root, &params),
            Operation::Retire => transitions::transition(self, root, Transition::Retire),
            Operation::Withdraw => transitions::transition(self, root, Transition::Withdraw),
            Operation::Delete => transitions::transition(self, root, Transition::Delete),
        }
    }

    /// Applies the planned mutations as one transaction.
    pub fn commit(&self, outcome: &LifecycleOutcome) -> Result<Bundle, ArtifactError> {
        let changes = self.pending_changes(&outcome.mutations)?;
        let response = self.repository.transaction(&outcome.mutations)?;
        if let Some(notifier) = &self.notifier {
            for change in changes {
                notifier.notify(change)?;
            }
        }
        tracing::info!(
            canonical = %outcome.root.canonical(),
            entries = response.entry.len(),
            "committed lifecycle transaction"
        );
        Ok(response)
    }

    /// Plans and commits in one step.
    pub fn run(
        &self,
        root: &CanonicalReference,
        operation: Operation,
    ) -> Result<LifecycleOutcome, ArtifactError> {
        let outcome = self.apply(root, operation)?;
        self.commit(&outcome)?;
        Ok(outcome)
    }

    fn pending_changes(&self, mutations: &Bundle) -> Result<Vec<ResourceChange>, ArtifactError> {
        if self.notifier.is_none() {
            return Ok(Vec::new());
        }
        let mut changes = Vec::new();
        for entry in &mutations.entry {
            let Some(request) = &entry.request else {
                continue;
            };
            match request.method {
                HttpVerb::Delete => {
                    let Some((resource_type, id)) = request.url.split_once('/') else {
                        continue;
                    };
                    if let Some(artifact) = self
                        .repository
                        .read_by_id(resource_type, id)?
                        .as_ref()
                        .and_then(|resource| resource.as_artifact())
                    {
                        changes.push(ResourceChange::Deleted(artifact.canonical()));
                    }
                }
                HttpVerb::Post | HttpVerb::Put => {
                    if let Some(artifact) = entry.resource.as_ref().and_then(|r| r.as_artifact()) {
                        changes.push(ResourceChange::Updated(artifact.canonical()));
                    }
                }
            }
        }
        Ok(changes)
    }

    fn owned_graph(&self, root: &CanonicalReference) -> Result<DependencyGraph, ArtifactError> {
        DependencyGraphWalker::new(&self.repository, WalkOptions::owned_only()).collect(root)
    }
}

/// Points every reference whose url is in `targets` at `version`, components and
/// dependencies alike.
fn rewrite_references<A: CanonicalArtifact>(
    artifact: &mut A,
    targets: &HashSet<String>,
    version: &str,
) {
    for related in artifact.related_artifacts_mut() {
        let Some(reference) = related.reference() else {
            continue;
        };
        if targets.contains(reference.url_key()) {
            related.resource = Some(reference.with_version(Some(version)).to_string());
        }
    }
}

fn precondition_status<A: CanonicalArtifact>(artifact: &A, action: &str, allowed: &str) -> ArtifactError {
    ArtifactError::Precondition(format!(
        "Cannot {action} resource '{}' with status '{}'; {action} requires status {allowed}",
        artifact.canonical(),
        artifact.status()
    ))
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::model::ArtifactStatus;
    use crate::repository::InMemoryRepository;

    #[test]
    fn operation_names_are_parsed_case_insensitively() {
        let params = ParameterMap::new().with("versionBehavior", "default");
        let operation = Operation::from_parameters("$Release", &params).unwrap();
        assert_eq!(operation.name(), "release");
        assert!(matches!(
            Operation::from_parameters("publish", &params),
            Err(ArtifactError::Validation(_))
        ));
    }

    #[test]
    fn apply_does_not_touch_the_repository() {
        let repository = InMemoryRepository::with_artifacts([artifact(
            "Library",
            "root",
            "1.0.0",
            ArtifactStatus::Active,
        )])
        .unwrap();
        let engine = LifecycleEngine::new(repository);
        let root = CanonicalReference::parse("http://ex.org/Library/root|1.0.0").unwrap();

        let outcome = engine.apply(&root, Operation::Retire).unwrap();
        assert_eq!(outcome.root.status, ArtifactStatus::Retired);
        let stored = engine.repository().read(&root).unwrap().unwrap();
        assert_eq!(stored.status, ArtifactStatus::Active);

        engine.commit(&outcome).unwrap();
        let stored = engine.repository().read(&root).unwrap().unwrap();
        assert_eq!(stored.status, ArtifactStatus::Retired);
    }

    #[test]
    fn commit_evicts_cached_expansions() {
        use crate::expansion_cache::{CacheKey, ExpansionCache};
        use crate::model::Expansion;

        let vs = artifact("ValueSet", "vs", "1.0.0", ArtifactStatus::Active);
        let reference = vs.canonical();
        let repository = InMemoryRepository::with_artifacts([vs]).unwrap();
        let cache = ExpansionCache::new();
        let key = CacheKey::new(reference.clone(), "none");
        cache.insert_if_absent(key.clone(), Expansion::default());

        let engine = LifecycleEngine::new(repository).with_cache_notifier(cache.notifier());
        engine.run(&reference, Operation::Retire).unwrap();
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn rewrite_follows_target_urls_not_ownership() {
        let mut root = artifact("Library", "root", "1.0.0-draft", ArtifactStatus::Draft);
        root.related_artifact = vec![
            owned("http://ex.org/Library/a|1.0.0-draft"),
            depends("http://ex.org/Library/a|1.0.0-draft"),
            depends("http://ex.org/ValueSet/other|2.0"),
        ];
        let targets = HashSet::from(["http://ex.org/Library/a".to_string()]);
        rewrite_references(&mut root, &targets, "1.0.0");
        assert_eq!(
            root.related_artifact[0].resource.as_deref(),
            Some("http://ex.org/Library/a|1.0.0")
        );
        assert_eq!(
            root.related_artifact[1].resource.as_deref(),
            Some("http://ex.org/Library/a|1.0.0")
        );
        assert_eq!(
            root.related_artifact[2].resource.as_deref(),
            Some("http://ex.org/ValueSet/other|2.0")
        );
    }
}
