use std::collections::HashSet;

use artifactman::{
    ApproveParams, ArtifactError, ArtifactRepository, ArtifactStatus, CanonicalReference,
    DraftParams, FhirDateTime, FilesystemRepository, KnowledgeArtifact, LifecycleEngine,
    Operation, RelatedArtifact, RelationType, ReleaseParams, Resource, SchemaVersion,
    VersionBehavior, WorkspaceConfig, init_workspace,
};
use tempfile::TempDir;

const ROOT_URL: &str = "http://ex.org/Library/root";

fn library(name: &str, version: &str, status: ArtifactStatus) -> KnowledgeArtifact {
    let mut artifact = KnowledgeArtifact::new(
        "Library",
        &format!("http://ex.org/Library/{name}"),
        Some(version),
    );
    artifact.id = Some(name.to_string());
    artifact.status = status;
    artifact.date = Some(FhirDateTime::parse("2024-01-01").unwrap());
    artifact
}

fn make_workspace() -> (TempDir, FilesystemRepository) {
    let temp = TempDir::new().unwrap();
    let paths = init_workspace(temp.path(), &WorkspaceConfig::default()).unwrap();
    let config = paths.load_config().unwrap();
    let repository =
        FilesystemRepository::open(config.artifacts_path(paths.root()), SchemaVersion::R4).unwrap();

    let mut root = library("root", "1.0.0-draft", ArtifactStatus::Draft);
    root.related_artifact = vec![
        RelatedArtifact::new(RelationType::ComposedOf, "http://ex.org/Library/child|1.0.0-draft")
            .owned(),
        RelatedArtifact::new(RelationType::DependsOn, "http://ex.org/Library/shared|2.0.0"),
    ];
    let child = library("child", "1.0.0-draft", ArtifactStatus::Draft);
    let shared = library("shared", "2.0.0", ArtifactStatus::Active);
    for artifact in [root, child, shared] {
        repository.create(Resource::Artifact(artifact)).unwrap();
    }
    (temp, repository)
}

fn reference(raw: &str) -> CanonicalReference {
    CanonicalReference::parse(raw).unwrap()
}

fn release() -> Operation {
    Operation::Release(ReleaseParams {
        version_behavior: Some(VersionBehavior::Default),
        ..Default::default()
    })
}

fn approve(date: Option<&str>) -> Operation {
    Operation::Approve(ApproveParams {
        approval_date: date.map(|raw| FhirDateTime::parse(raw).unwrap()),
        ..Default::default()
    })
}

fn assert_no_duplicate_relations(artifact: &KnowledgeArtifact) {
    let mut seen = HashSet::new();
    for related in &artifact.related_artifact {
        assert!(
            seen.insert((related.relation, related.resource.clone())),
            "duplicate relatedArtifact {:?} {}",
            related.relation,
            related.resource.as_deref().unwrap_or_default()
        );
    }
}

#[test]
fn release_requires_approval() {
    let (_temp, repository) = make_workspace();
    let engine = LifecycleEngine::new(repository);
    let err = engine
        .run(&reference("http://ex.org/Library/root|1.0.0-draft"), release())
        .expect_err("unapproved release");
    assert!(matches!(err, ArtifactError::Unprocessable { .. }));
    assert_eq!(err.http_status(), 422);
}

#[test]
fn draft_approve_release_cycle_persists_to_disk() {
    let (_temp, repository) = make_workspace();
    let artifacts_dir = repository.dir().to_path_buf();
    let engine = LifecycleEngine::new(repository);

    engine
        .run(&reference("http://ex.org/Library/root|1.0.0-draft"), approve(Some("2024-03-01")))
        .unwrap();
    let released = engine
        .run(&reference("http://ex.org/Library/root|1.0.0-draft"), release())
        .unwrap()
        .root;
    assert_eq!(released.version.as_deref(), Some("1.0.0"));
    assert_eq!(released.status, ArtifactStatus::Active);
    assert!(
        released
            .related_artifact
            .iter()
            .filter_map(|related| related.resource.as_deref())
            .all(|resource| !resource.ends_with("-draft"))
    );
    assert!(released.related_artifact.iter().any(|related| {
        related.relation == RelationType::DependsOn
            && related.resource.as_deref() == Some("http://ex.org/Library/shared|2.0.0")
    }));
    assert_no_duplicate_relations(&released);

    let child = engine
        .repository()
        .read(&reference("http://ex.org/Library/child|1.0.0"))
        .unwrap()
        .expect("child released with the root");
    assert_eq!(child.status, ArtifactStatus::Active);

    let reopened = FilesystemRepository::open(&artifacts_dir, SchemaVersion::R4).unwrap();
    let stored = reopened
        .read(&reference("http://ex.org/Library/root|1.0.0"))
        .unwrap()
        .expect("release written to disk");
    assert_eq!(stored.status, ArtifactStatus::Active);

    let drafted = engine
        .run(
            &reference("http://ex.org/Library/root|1.0.0"),
            Operation::Draft(DraftParams {
                version: Some("1.1.0".into()),
            }),
        )
        .unwrap()
        .root;
    assert_eq!(drafted.version.as_deref(), Some("1.1.0-draft"));
    assert_eq!(drafted.status, ArtifactStatus::Draft);
    assert!(drafted.approval_date.is_none());
    assert!(drafted.related_artifact.iter().any(|related| {
        related.is_owned()
            && related.resource.as_deref() == Some("http://ex.org/Library/child|1.1.0-draft")
    }));
    assert!(
        drafted
            .related_artifact
            .iter()
            .all(|related| related.resource.as_deref() != Some("http://ex.org/Library/child|1.0.0"))
    );

    engine
        .run(&reference("http://ex.org/Library/root|1.1.0-draft"), approve(None))
        .unwrap();
    let rereleased = engine
        .run(&reference("http://ex.org/Library/root|1.1.0-draft"), release())
        .unwrap()
        .root;
    assert_eq!(rereleased.version.as_deref(), Some("1.1.0"));
    assert_no_duplicate_relations(&rereleased);

    let mut versions: Vec<String> = engine
        .repository()
        .search(ROOT_URL)
        .unwrap()
        .into_iter()
        .filter_map(|artifact| artifact.version)
        .collect();
    versions.sort();
    assert_eq!(versions, vec!["1.0.0".to_string(), "1.1.0".to_string()]);
}

#[test]
fn withdraw_is_limited_to_drafts() {
    let (_temp, repository) = make_workspace();
    let engine = LifecycleEngine::new(repository);
    let err = engine
        .run(&reference("http://ex.org/Library/shared|2.0.0"), Operation::Withdraw)
        .expect_err("active artifacts are not withdrawn");
    assert!(matches!(err, ArtifactError::Precondition(_)));

    let retired = engine
        .run(&reference("http://ex.org/Library/shared|2.0.0"), Operation::Retire)
        .unwrap()
        .root;
    assert_eq!(retired.status, ArtifactStatus::Retired);
}
