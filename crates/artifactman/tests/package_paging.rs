use artifactman::{
    ArtifactError, ArtifactStatus, BundleType, CanonicalReference, ExpansionCache,
    InMemoryRepository, KnowledgeArtifact, PackageAssembler, PackageParams, RelatedArtifact,
    RelationType,
};

const DEPENDENCIES: usize = 8;

fn repository() -> InMemoryRepository {
    let mut root = KnowledgeArtifact::new("Library", "http://ex.org/Library/program", Some("1.0.0"));
    root.status = ArtifactStatus::Active;
    let mut artifacts = Vec::new();
    for index in 0..DEPENDENCIES {
        let url = format!("http://ex.org/Library/dep-{index}");
        root.related_artifact.push(RelatedArtifact::new(
            RelationType::DependsOn,
            format!("{url}|1.0.0"),
        ));
        let mut dependency = KnowledgeArtifact::new("Library", &url, Some("1.0.0"));
        dependency.status = ArtifactStatus::Active;
        artifacts.push(dependency);
    }
    artifacts.push(root);
    InMemoryRepository::with_artifacts(artifacts).unwrap()
}

fn package(params: PackageParams) -> Result<artifactman::Bundle, ArtifactError> {
    let repository = repository();
    let cache = ExpansionCache::new();
    PackageAssembler::new(&repository, &cache).package(
        &CanonicalReference::parse("http://ex.org/Library/program|1.0.0").unwrap(),
        &params,
    )
}

fn paged(count: Option<i64>, offset: Option<i64>) -> PackageParams {
    PackageParams {
        count,
        offset,
        ..Default::default()
    }
}

#[test]
fn unpaged_searchset_holds_everything() {
    let bundle = package(PackageParams::default()).unwrap();
    assert_eq!(bundle.kind, BundleType::Searchset);
    assert_eq!(bundle.total, Some(DEPENDENCIES + 1));
    assert_eq!(bundle.entry.len(), DEPENDENCIES + 1);
    let first = bundle.entry[0].resource.as_ref().unwrap();
    assert_eq!(first.as_artifact().unwrap().url, "http://ex.org/Library/program");
}

#[test]
fn count_zero_reports_total_only() {
    let bundle = package(paged(Some(0), None)).unwrap();
    assert!(bundle.entry.is_empty());
    assert_eq!(bundle.total, Some(DEPENDENCIES + 1));
}

#[test]
fn offset_at_total_is_empty() {
    let total = (DEPENDENCIES + 1) as i64;
    let bundle = package(paged(None, Some(total))).unwrap();
    assert!(bundle.entry.is_empty());
    assert_eq!(bundle.total, Some(DEPENDENCIES + 1));
}

#[test]
fn offset_near_total_returns_tail() {
    let total = (DEPENDENCIES + 1) as i64;
    let bundle = package(paged(None, Some(total - 4))).unwrap();
    assert_eq!(bundle.entry.len(), 4);
}

#[test]
fn pages_do_not_overlap() {
    let first = package(paged(Some(5), Some(0))).unwrap();
    let second = package(paged(Some(5), Some(5))).unwrap();
    assert_eq!(first.entry.len() + second.entry.len(), DEPENDENCIES + 1);
    let urls = |bundle: &artifactman::Bundle| -> Vec<String> {
        bundle
            .entry
            .iter()
            .filter_map(|entry| entry.resource.as_ref()?.as_artifact())
            .map(|artifact| artifact.url.clone())
            .collect()
    };
    let first_urls = urls(&first);
    assert!(urls(&second).iter().all(|url| !first_urls.contains(url)));
}

#[test]
fn paging_a_transaction_is_rejected() {
    let err = package(PackageParams {
        count: Some(2),
        bundle_type: Some(BundleType::Transaction),
        ..Default::default()
    })
    .expect_err("paged transaction");
    assert_eq!(err.http_status(), 400);
}
