use crate::artifact::CanonicalArtifact;
use crate::bundle::{Bundle, Resource};
use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;
use crate::model::{ArtifactStatus, FhirDateTime};
use crate::repository::ArtifactRepository;

use super::{LifecycleEngine, LifecycleOutcome, precondition_status};

/// Status-only transitions cascading over owned components.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Retire,
    Withdraw,
    Delete,
}

impl Transition {
    pub fn required_status(self) -> ArtifactStatus {
        match self {
            Transition::Retire => ArtifactStatus::Active,
            Transition::Withdraw => ArtifactStatus::Draft,
            Transition::Delete => ArtifactStatus::Retired,
        }
    }

    fn verb(self) -> &'static str {
        match self {
            Transition::Retire => "retire",
            Transition::Withdraw => "withdraw",
            Transition::Delete => "delete",
        }
    }
}

pub(super) fn transition<R: ArtifactRepository>(
    engine: &LifecycleEngine<R>,
    root_ref: &CanonicalReference,
    kind: Transition,
) -> Result<LifecycleOutcome, ArtifactError> {
    let graph = engine.owned_graph(root_ref)?;
    let root = graph.root_artifact()?.clone();
    let required = kind.required_status();
    if root.status() != required {
        return Err(precondition_status(
            &root,
            kind.verb(),
            &format!("'{required}'"),
        ));
    }

    let mut targets = vec![root.clone()];
    for id in graph.owned_descendants() {
        let node = graph.node(id);
        match &node.artifact {
            Some(component) if component.status() == required => targets.push(component.clone()),
            Some(component) => tracing::debug!(
                component = %node.reference,
                status = %component.status(),
                "skipping owned component with a different status"
            ),
            None => tracing::debug!(component = %node.reference, "skipping unresolved owned component"),
        }
    }

    let now = FhirDateTime::now();
    let mut mutations = Bundle::transaction();
    let mut warnings = Vec::new();
    let mut outcome_root = root.clone();
    for (idx, mut target) in targets.into_iter().enumerate() {
        match kind {
            Transition::Retire => {
                target.set_status(ArtifactStatus::Retired);
                target.set_date(Some(now));
                if idx == 0 {
                    outcome_root = target.clone();
                }
                mutations.push_put(Resource::Artifact(target));
            }
            Transition::Withdraw | Transition::Delete => match target.id() {
                Some(id) => mutations.push_delete(target.resource_type(), id),
                None => {
                    let message = format!("{} has no id and cannot be removed", target.descriptor());
                    tracing::warn!(canonical = %target.canonical(), "artifact without id");
                    warnings.push(message);
                }
            },
        }
    }

    tracing::info!(
        canonical = %root.canonical(),
        operation = kind.verb(),
        entries = mutations.entry.len(),
        "planned lifecycle transition"
    );
    Ok(LifecycleOutcome {
        root: outcome_root,
        mutations,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::super::Operation;
    use super::super::fixtures::*;
    use super::*;
    use crate::repository::InMemoryRepository;

    fn repository(status: ArtifactStatus, child_status: ArtifactStatus) -> InMemoryRepository {
        let mut root = artifact("Library", "root", "1.0.0", status);
        root.related_artifact = vec![
            owned("http://ex.org/Library/child|1.0.0"),
            owned("http://ex.org/Library/other|1.0.0"),
        ];
        let child = artifact("Library", "child", "1.0.0", child_status);
        let other = artifact("Library", "other", "1.0.0", ArtifactStatus::Unknown);
        InMemoryRepository::with_artifacts([root, child, other]).unwrap()
    }

    fn root_ref() -> CanonicalReference {
        CanonicalReference::parse("http://ex.org/Library/root|1.0.0").unwrap()
    }

    #[test]
    fn each_transition_requires_exactly_one_status() {
        let cases = [
            (Transition::Retire, ArtifactStatus::Active),
            (Transition::Withdraw, ArtifactStatus::Draft),
            (Transition::Delete, ArtifactStatus::Retired),
        ];
        let statuses = [
            ArtifactStatus::Draft,
            ArtifactStatus::Active,
            ArtifactStatus::Retired,
        ];
        for (transition, allowed) in cases {
            for status in statuses {
                let engine = LifecycleEngine::new(repository(status, status));
                let operation = match transition {
                    Transition::Retire => Operation::Retire,
                    Transition::Withdraw => Operation::Withdraw,
                    Transition::Delete => Operation::Delete,
                };
                let result = engine.apply(&root_ref(), operation);
                if status == allowed {
                    assert!(result.is_ok(), "{transition:?} from {status} should succeed");
                } else {
                    assert!(
                        matches!(result, Err(ArtifactError::Precondition(_))),
                        "{transition:?} from {status} should be a precondition failure"
                    );
                }
            }
        }
    }

    #[test]
    fn retire_cascades_to_matching_components() {
        let engine = LifecycleEngine::new(repository(ArtifactStatus::Active, ArtifactStatus::Active));
        let outcome = engine.run(&root_ref(), Operation::Retire).unwrap();
        assert_eq!(outcome.root.status, ArtifactStatus::Retired);
        assert_eq!(outcome.mutations.entry.len(), 2);

        let other = engine
            .repository()
            .read(&CanonicalReference::parse("http://ex.org/Library/other|1.0.0").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(other.status, ArtifactStatus::Unknown);
    }

    #[test]
    fn delete_removes_retired_graph() {
        let engine =
            LifecycleEngine::new(repository(ArtifactStatus::Retired, ArtifactStatus::Retired));
        engine.run(&root_ref(), Operation::Delete).unwrap();
        assert_eq!(engine.repository().len(), 1);
        assert!(
            engine
                .repository()
                .read(&root_ref())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn withdraw_removes_draft_and_owned_drafts() {
        let engine = LifecycleEngine::new(repository(ArtifactStatus::Draft, ArtifactStatus::Draft));
        let outcome = engine.run(&root_ref(), Operation::Withdraw).unwrap();
        assert_eq!(outcome.mutations.entry.len(), 2);
        assert_eq!(engine.repository().len(), 1);
    }
}
