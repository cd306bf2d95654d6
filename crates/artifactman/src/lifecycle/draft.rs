use std::collections::HashSet;

use crate::artifact::CanonicalArtifact;
use crate::bundle::{Bundle, Resource};
use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;
use crate::ids;
use crate::model::{ArtifactStatus, KnowledgeArtifact, RELEASE_DESCRIPTION_URL, RELEASE_LABEL_URL};
use crate::params::ParameterMap;
use crate::repository::ArtifactRepository;
use crate::version;

use super::{LifecycleEngine, LifecycleOutcome, precondition_status, rewrite_references};

#[derive(Clone, Debug, Default)]
pub struct DraftParams {
    /// Base version for the draft; defaults to the current version.
    pub version: Option<String>,
}

impl DraftParams {
    pub fn from_parameters(params: &ParameterMap) -> Result<Self, ArtifactError> {
        Ok(Self {
            version: params.string("version").map(str::to_string),
        })
    }
}

pub(super) fn draft<R: ArtifactRepository>(
    engine: &LifecycleEngine<R>,
    root_ref: &CanonicalReference,
    params: &DraftParams,
) -> Result<LifecycleOutcome, ArtifactError> {
    let graph = engine.owned_graph(root_ref)?;
    let root = graph.root_artifact()?;
    if !matches!(root.status(), ArtifactStatus::Active | ArtifactStatus::Retired) {
        return Err(precondition_status(root, "draft", "'active' or 'retired'"));
    }

    let base = params
        .version
        .as_deref()
        .or(root.version().map(version::strip_draft_suffix))
        .unwrap_or_default();
    version::validate(base)?;
    let draft_version = version::to_draft_suffix(base);

    let existing = engine.repository().search(root.url())?;
    if existing
        .iter()
        .any(|candidate| candidate.version.as_deref() == Some(draft_version.as_str()))
    {
        return Err(ArtifactError::Precondition(format!(
            "A draft of Program '{}' already exists with version '{draft_version}'. Only one draft of a program can exist at a time.",
            root.url()
        )));
    }

    let mut sources = vec![root.clone()];
    for id in graph.owned_descendants() {
        match &graph.node(id).artifact {
            Some(component) => sources.push(component.clone()),
            None => tracing::warn!(
                component = %graph.node(id).reference,
                "owned component could not be resolved, not drafted"
            ),
        }
    }
    let drafted_urls: HashSet<String> = sources
        .iter()
        .map(|artifact| artifact.canonical().url_key().to_string())
        .collect();

    let mut mutations = Bundle::transaction();
    let mut drafted_root = None;
    let mut allocated = HashSet::new();
    for source in sources {
        let id = free_id(engine, &source, &draft_version, &mut allocated)?;
        let copy = draft_copy(source, id, &draft_version, &drafted_urls);
        if drafted_root.is_none() {
            drafted_root = Some(copy.clone());
        }
        mutations.push_post(Resource::Artifact(copy));
    }
    let root = drafted_root
        .ok_or_else(|| ArtifactError::NotFound(format!("artifact '{root_ref}' was not found")))?;

    tracing::info!(
        canonical = %root.canonical(),
        copies = mutations.entry.len(),
        "planned draft"
    );
    Ok(LifecycleOutcome {
        root,
        mutations,
        warnings: Vec::new(),
    })
}

/// `<tail>-<draft version>`, or a random id when a released artifact or an earlier copy in
/// this draft already holds that one.
fn free_id<R: ArtifactRepository>(
    engine: &LifecycleEngine<R>,
    source: &KnowledgeArtifact,
    draft_version: &str,
    allocated: &mut HashSet<String>,
) -> Result<String, ArtifactError> {
    let candidate = ids::canonical_id(source.canonical().tail(), Some(draft_version));
    let taken = allocated.contains(&allocation_key(source, &candidate))
        || engine
            .repository()
            .read_by_id(source.resource_type(), &candidate)?
            .is_some();
    let id = if taken { ids::random_id()? } else { candidate };
    allocated.insert(allocation_key(source, &id));
    Ok(id)
}

fn allocation_key(source: &KnowledgeArtifact, id: &str) -> String {
    format!("{}/{id}", source.resource_type())
}

fn draft_copy(
    mut artifact: KnowledgeArtifact,
    id: String,
    draft_version: &str,
    drafted_urls: &HashSet<String>,
) -> KnowledgeArtifact {
    artifact.set_id(Some(id));
    artifact.set_version(Some(draft_version.to_string()));
    artifact.set_status(ArtifactStatus::Draft);
    artifact.set_approval_date(None);
    artifact.set_effective_period(None);
    artifact
        .extensions_mut()
        .retain(|ext| ext.url != RELEASE_LABEL_URL && ext.url != RELEASE_DESCRIPTION_URL);
    rewrite_references(&mut artifact, drafted_urls, draft_version);
    artifact
}

#[cfg(test)]
mod tests {
    use super::super::Operation;
    use super::super::fixtures::*;
    use super::*;
    use crate::model::{Extension, FhirDateTime, Period};
    use crate::repository::InMemoryRepository;

    fn released_repository() -> InMemoryRepository {
        let mut root = approved(artifact("Library", "root", "1.0.0", ArtifactStatus::Active));
        root.effective_period = Some(Period {
            start: Some(FhirDateTime::parse("2024-01-01").unwrap()),
            end: None,
        });
        root.extension.push(Extension::string(RELEASE_LABEL_URL, "Q1"));
        root.related_artifact = vec![owned("http://ex.org/Library/child|1.0.0")];
        let child = approved(artifact("Library", "child", "1.0.0", ArtifactStatus::Active));
        InMemoryRepository::with_artifacts([root, child]).unwrap()
    }

    fn released_ref() -> CanonicalReference {
        CanonicalReference::parse("http://ex.org/Library/root|1.0.0").unwrap()
    }

    #[test]
    fn draft_copies_root_and_owned_components() {
        let engine = LifecycleEngine::new(released_repository());
        let outcome = engine
            .run(&released_ref(), Operation::Draft(DraftParams::default()))
            .unwrap();

        assert_eq!(outcome.root.version.as_deref(), Some("1.0.0-draft"));
        assert_eq!(outcome.root.status, ArtifactStatus::Draft);
        assert!(outcome.root.approval_date.is_none());
        assert!(outcome.root.effective_period.is_none());
        assert!(outcome.root.extension_by_url(RELEASE_LABEL_URL).is_none());
        assert_eq!(
            outcome.root.related_artifact[0].resource.as_deref(),
            Some("http://ex.org/Library/child|1.0.0-draft")
        );
        assert_eq!(outcome.mutations.entry.len(), 2);

        let child = engine
            .repository()
            .read(&CanonicalReference::parse("http://ex.org/Library/child|1.0.0-draft").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(child.status, ArtifactStatus::Draft);
        assert_ne!(child.id.as_deref(), Some("child-1.0.0"));
    }

    #[test]
    fn only_one_draft_may_exist() {
        let engine = LifecycleEngine::new(released_repository());
        engine
            .run(&released_ref(), Operation::Draft(DraftParams::default()))
            .unwrap();
        let err = engine
            .apply(&released_ref(), Operation::Draft(DraftParams::default()))
            .expect_err("draft exists");
        match err {
            ArtifactError::Precondition(msg) => assert_eq!(
                msg,
                "A draft of Program 'http://ex.org/Library/root' already exists with version '1.0.0-draft'. Only one draft of a program can exist at a time."
            ),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn drafting_a_draft_is_precondition() {
        let repository = InMemoryRepository::with_artifacts([artifact(
            "Library",
            "root",
            "1.0.0-draft",
            ArtifactStatus::Draft,
        )])
        .unwrap();
        let engine = LifecycleEngine::new(repository);
        let err = engine
            .apply(
                &CanonicalReference::parse("http://ex.org/Library/root|1.0.0-draft").unwrap(),
                Operation::Draft(DraftParams::default()),
            )
            .expect_err("already a draft");
        assert!(matches!(err, ArtifactError::Precondition(_)));
    }

    #[test]
    fn draft_after_release_does_not_reuse_held_ids() {
        let mut root = approved(artifact("Library", "root", "1.0.0", ArtifactStatus::Active));
        root.id = Some("root-1.0.0-draft".into());
        let engine = LifecycleEngine::new(InMemoryRepository::with_artifacts([root]).unwrap());
        let outcome = engine
            .run(&released_ref(), Operation::Draft(DraftParams::default()))
            .unwrap();
        assert_ne!(outcome.root.id.as_deref(), Some("root-1.0.0-draft"));
        assert_eq!(engine.repository().len(), 2);
    }

    #[test]
    fn components_sharing_a_tail_get_distinct_ids() {
        let mut root = approved(artifact("Library", "root", "1.0.0", ArtifactStatus::Active));
        root.related_artifact = vec![
            owned("http://ex.org/ValueSet/x|1.0.0"),
            owned("http://other.org/ValueSet/x|1.0.0"),
        ];
        let local = artifact("ValueSet", "x", "1.0.0", ArtifactStatus::Active);
        let mut foreign = KnowledgeArtifact::new("ValueSet", "http://other.org/ValueSet/x", Some("1.0.0"));
        foreign.id = Some("x-other".into());
        foreign.status = ArtifactStatus::Active;
        let engine = LifecycleEngine::new(
            InMemoryRepository::with_artifacts([root, local, foreign]).unwrap(),
        );

        let outcome = engine
            .run(&released_ref(), Operation::Draft(DraftParams::default()))
            .unwrap();
        assert_eq!(outcome.mutations.entry.len(), 3);

        let read = |url: &str| {
            engine
                .repository()
                .read(&CanonicalReference::parse(url).unwrap())
                .unwrap()
                .unwrap()
        };
        let local = read("http://ex.org/ValueSet/x|1.0.0-draft");
        let foreign = read("http://other.org/ValueSet/x|1.0.0-draft");
        assert_eq!(local.status, ArtifactStatus::Draft);
        assert_eq!(foreign.status, ArtifactStatus::Draft);
        assert_ne!(local.id, foreign.id);
    }

    #[test]
    fn owned_dependency_pins_follow_the_draft() {
        let mut root = approved(artifact("Library", "root", "1.0.0", ArtifactStatus::Active));
        root.related_artifact = vec![
            owned("http://ex.org/Library/child|1.0.0"),
            depends("http://ex.org/Library/child|1.0.0"),
            depends("http://ex.org/ValueSet/shared|3.0"),
        ];
        let child = approved(artifact("Library", "child", "1.0.0", ArtifactStatus::Active));
        let shared = artifact("ValueSet", "shared", "3.0", ArtifactStatus::Active);
        let engine = LifecycleEngine::new(
            InMemoryRepository::with_artifacts([root, child, shared]).unwrap(),
        );

        let outcome = engine
            .apply(&released_ref(), Operation::Draft(DraftParams::default()))
            .unwrap();
        let targets: Vec<_> = outcome
            .root
            .related_artifact
            .iter()
            .map(|related| related.resource.as_deref())
            .collect();
        assert_eq!(
            targets,
            vec![
                Some("http://ex.org/Library/child|1.0.0-draft"),
                Some("http://ex.org/Library/child|1.0.0-draft"),
                Some("http://ex.org/ValueSet/shared|3.0"),
            ]
        );
    }

    #[test]
    fn requested_version_is_validated() {
        let engine = LifecycleEngine::new(released_repository());
        let err = engine
            .apply(
                &released_ref(),
                Operation::Draft(DraftParams {
                    version: Some("2.0-draft".into()),
                }),
            )
            .expect_err("draft in version");
        assert!(matches!(err, ArtifactError::Validation(_)));
    }
}
