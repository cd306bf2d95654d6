use std::fs;
use std::path::Path;

use artifactman::{
    ArtifactDiffEngine, CanonicalReference, ChangeLogFormat, ChangeLogRenderer, DiffOperationType,
    DiffOptions, FilesystemRepository, SchemaVersion,
};
use serde_json::{Value, json};
use tempfile::TempDir;

fn write(dir: &Path, name: &str, value: Value) {
    fs::write(dir.join(name), serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

fn leaf(version: &str, codes: &[&str]) -> Value {
    json!({
        "resourceType": "ValueSet",
        "id": format!("leaf-{version}"),
        "url": "http://ex.org/ValueSet/leaf",
        "version": version,
        "name": "Leaf",
        "status": "active",
        "compose": {
            "include": [{
                "system": "http://snomed.info/sct",
                "concept": codes.iter().map(|code| json!({ "code": code })).collect::<Vec<_>>()
            }]
        }
    })
}

fn workspace() -> (TempDir, FilesystemRepository) {
    let temp = TempDir::new().unwrap();
    let dir = temp.path();
    for version in ["1.0.0", "2.0.0"] {
        write(
            dir,
            &format!("Library-manifest-{version}.json"),
            json!({
                "resourceType": "Library",
                "id": format!("manifest-{version}"),
                "url": "http://ex.org/Library/manifest",
                "version": version,
                "status": "active",
                "relatedArtifact": [{
                    "type": "depends-on",
                    "resource": format!("http://ex.org/ValueSet/grouper|{version}")
                }]
            }),
        );
        write(
            dir,
            &format!("ValueSet-grouper-{version}.json"),
            json!({
                "resourceType": "ValueSet",
                "id": format!("grouper-{version}"),
                "url": "http://ex.org/ValueSet/grouper",
                "version": version,
                "name": "Grouper",
                "status": "active",
                "compose": {
                    "include": [{ "valueSet": [format!("http://ex.org/ValueSet/leaf|{version}")] }]
                }
            }),
        );
    }
    write(dir, "ValueSet-leaf-1.0.0.json", leaf("1.0.0", &["a", "b"]));
    write(dir, "ValueSet-leaf-2.0.0.json", leaf("2.0.0", &["b", "c"]));
    let repository = FilesystemRepository::open(dir, SchemaVersion::R4).unwrap();
    (temp, repository)
}

fn reference(raw: &str) -> CanonicalReference {
    CanonicalReference::parse(raw).unwrap()
}

#[test]
fn reversing_a_diff_swaps_inserts_and_deletes() {
    let (_temp, repository) = workspace();
    let engine = ArtifactDiffEngine::new(DiffOptions::default());
    let forward = engine
        .diff_references(
            &repository,
            &reference("http://ex.org/Library/manifest|1.0.0"),
            &reference("http://ex.org/Library/manifest|2.0.0"),
        )
        .unwrap();
    let backward = engine
        .diff_references(
            &repository,
            &reference("http://ex.org/Library/manifest|2.0.0"),
            &reference("http://ex.org/Library/manifest|1.0.0"),
        )
        .unwrap();

    assert!(forward.operation_count() > 0);
    assert_eq!(
        forward.count(DiffOperationType::Insert),
        backward.count(DiffOperationType::Delete)
    );
    assert_eq!(
        forward.count(DiffOperationType::Delete),
        backward.count(DiffOperationType::Insert)
    );
    assert_eq!(
        forward.count(DiffOperationType::Replace),
        backward.count(DiffOperationType::Replace)
    );

    let leaf = forward.page("http://ex.org/ValueSet/leaf").expect("leaf page");
    assert_eq!(leaf.count(DiffOperationType::Insert), 1);
    assert_eq!(leaf.count(DiffOperationType::Delete), 1);
}

#[test]
fn diffing_a_version_against_itself_is_empty() {
    let (_temp, repository) = workspace();
    let manifest = reference("http://ex.org/Library/manifest|2.0.0");
    let changelog = ArtifactDiffEngine::new(DiffOptions::default())
        .diff_references(&repository, &manifest, &manifest)
        .unwrap();
    assert_eq!(changelog.operation_count(), 0);
    assert_eq!(changelog.pages.len(), 3);
}

#[test]
fn rendered_markdown_summarizes_loaded_changes() {
    let (_temp, repository) = workspace();
    let changelog = ArtifactDiffEngine::new(DiffOptions::default())
        .diff_references(
            &repository,
            &reference("http://ex.org/Library/manifest|1.0.0"),
            &reference("http://ex.org/Library/manifest|2.0.0"),
        )
        .unwrap();
    let renderer = ChangeLogRenderer::new();
    let markdown = renderer.render(&changelog, ChangeLogFormat::Markdown).unwrap();
    assert!(markdown.contains("# Changelog: http://ex.org/Library/manifest"));
    assert!(markdown.contains("## ValueSet http://ex.org/ValueSet/leaf"));

    let attachment = renderer.attachment(&changelog).unwrap();
    assert!(attachment.verify());
}
