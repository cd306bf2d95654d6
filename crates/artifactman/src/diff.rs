//! Structural diff between two dependency-graph snapshots.
//!
//! Every value set and artifact in either graph gets a [`Page`] keyed by its identity (member OID when the
//! url ends in one, the canonical url otherwise). Grouper pages align their leaves by the same identity, so
//! reordering includes never produces operations. Each page carries the old and new snapshots, annotated with
//! the operation that touched each field or code, plus the flat operation log.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::canonical::CanonicalReference;
use crate::dependency_graph::{DependencyGraph, DependencyGraphWalker, WalkOptions};
use crate::error::ArtifactError;
use crate::expansion::{naive_expansion, params_hash};
use crate::expansion_cache::{CacheKey, ExpansionCache};
use crate::model::{Expansion, KnowledgeArtifact};
use crate::params::ParameterMap;
use crate::repository::ArtifactRepository;

pub const URLS_DONT_MATCH: &str = "URLs don't match";
pub const WRONG_TYPE: &str = "wrong type";

fn oid_regex() -> &'static Regex {
    static OID: OnceLock<Regex> = OnceLock::new();
    OID.get_or_init(|| Regex::new(r"^[0-2](\.\d+)+$").expect("Invalid regex"))
}

/// Identity used to align pages and leaves across snapshots.
pub fn identity_key(artifact: &KnowledgeArtifact) -> &str {
    url_identity(&artifact.url)
}

fn url_identity(url: &str) -> &str {
    let url = url.trim_end_matches('/');
    let tail = url.rsplit('/').next().unwrap_or(url);
    if oid_regex().is_match(tail) { tail } else { url }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DiffOperationType {
    Insert,
    Delete,
    Replace,
}

impl fmt::Display for DiffOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DiffOperationType::Insert => "insert",
            DiffOperationType::Delete => "delete",
            DiffOperationType::Replace => "replace",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiffOperation {
    #[serde(rename = "type")]
    pub op: DiffOperationType,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl DiffOperation {
    fn insert(path: String, value: Value) -> Self {
        Self {
            op: DiffOperationType::Insert,
            path,
            old_value: None,
            new_value: Some(value),
        }
    }

    fn delete(path: String, value: Value) -> Self {
        Self {
            op: DiffOperationType::Delete,
            path,
            old_value: Some(value),
            new_value: None,
        }
    }

    fn one_sided(op: DiffOperationType, path: String, value: Value) -> Self {
        match op {
            DiffOperationType::Insert => Self::insert(path, value),
            _ => Self::delete(path, value),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiffOptions {
    pub compare_computable: bool,
    pub compare_executable: bool,
}

impl DiffOptions {
    pub fn from_parameters(params: &ParameterMap) -> Result<Self, ArtifactError> {
        Ok(Self {
            compare_computable: params.boolean("compareComputable")?.unwrap_or(false),
            compare_executable: params.boolean("compareExecutable")?.unwrap_or(false),
        })
    }

    /// Compose codes are compared unless only the executable view was requested.
    fn computable(&self) -> bool {
        self.compare_computable || !self.compare_executable
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CodeEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DiffOperationType>,
}

impl CodeEntry {
    fn coded_key(&self) -> String {
        format!("{}|{}", self.system.as_deref().unwrap_or_default(), self.code)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LeafSnapshot {
    pub key: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_systems: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<CodeEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CodeEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expansion: Vec<CodeEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DiffOperationType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changes: BTreeMap<String, DiffOperationType>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ValueSetSnapshot {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub grouper: bool,
    #[serde(default)]
    pub leaves: Vec<LeafSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DiffOperationType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changes: BTreeMap<String, DiffOperationType>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RelatedEntry {
    pub resource: String,
    pub relation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DiffOperationType>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSnapshot {
    pub resource_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_artifacts: Vec<RelatedEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<DiffOperationType>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changes: BTreeMap<String, DiffOperationType>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PageData {
    ValueSet(ValueSetSnapshot),
    Artifact(ArtifactSnapshot),
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub url: String,
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_data: Option<PageData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_data: Option<PageData>,
    #[serde(default)]
    pub operations: Vec<DiffOperation>,
}

impl Page {
    pub fn count(&self, op: DiffOperationType) -> usize {
        self.operations.iter().filter(|o| o.op == op).count()
    }

    pub fn is_grouper(&self) -> bool {
        [&self.old_data, &self.new_data]
            .into_iter()
            .flatten()
            .any(|data| matches!(data, PageData::ValueSet(vs) if vs.grouper))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLog {
    pub manifest_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    pub pages: Vec<Page>,
}

impl ChangeLog {
    /// Every change once. A grouper page repeats the operations of its leaves; the copies of
    /// leaves that also have a page of their own are skipped.
    pub fn operations(&self) -> impl Iterator<Item = &DiffOperation> {
        let paged: HashSet<&str> = self.pages.iter().map(|page| url_identity(&page.url)).collect();
        self.pages
            .iter()
            .flat_map(|page| {
                let grouper = page.is_grouper();
                page.operations.iter().map(move |op| (grouper, op))
            })
            .filter(move |(grouper, op)| !(*grouper && repeats_paged_leaf(&op.path, &paged)))
            .map(|(_, op)| op)
    }

    pub fn operation_count(&self) -> usize {
        self.operations().count()
    }

    pub fn count(&self, op: DiffOperationType) -> usize {
        self.operations().filter(|o| o.op == op).count()
    }

    pub fn page(&self, url: &str) -> Option<&Page> {
        let wanted = url.trim_end_matches('/');
        self.pages
            .iter()
            .find(|page| page.url.trim_end_matches('/') == wanted)
    }
}

pub struct ArtifactDiffEngine<'a> {
    options: DiffOptions,
    cache: Option<&'a ExpansionCache>,
}

impl<'a> ArtifactDiffEngine<'a> {
    pub fn new(options: DiffOptions) -> Self {
        Self {
            options,
            cache: None,
        }
    }

    /// Cached expansions are preferred over naive ones in executable mode.
    pub fn with_cache(mut self, cache: &'a ExpansionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Walks both references transitively through `repository` and diffs the resulting graphs.
    pub fn diff_references<R: ArtifactRepository + ?Sized>(
        &self,
        repository: &R,
        source: &CanonicalReference,
        target: &CanonicalReference,
    ) -> Result<ChangeLog, ArtifactError> {
        let walker = DependencyGraphWalker::new(repository, WalkOptions::transitive());
        let source_graph = walker.collect(source)?;
        let target_graph = walker.collect(target)?;
        self.diff(&source_graph, &target_graph)
    }

    pub fn diff(
        &self,
        source: &DependencyGraph,
        target: &DependencyGraph,
    ) -> Result<ChangeLog, ArtifactError> {
        let source_root = source.root_artifact()?;
        let target_root = target.root_artifact()?;
        if !source_root.canonical().same_url(&target_root.canonical()) {
            return Err(ArtifactError::unprocessable(URLS_DONT_MATCH));
        }
        if source_root.resource_type != target_root.resource_type {
            return Err(ArtifactError::unprocessable(WRONG_TYPE));
        }

        let source_index = index_artifacts(source);
        let target_index = index_artifacts(target);
        let mut keys: Vec<&str> = source_index.order.clone();
        keys.extend(
            target_index
                .order
                .iter()
                .filter(|key| !source_index.by_key.contains_key(*key)),
        );

        let mut changelog = ChangeLog {
            manifest_url: source_root.url.clone(),
            source_version: source_root.version.clone(),
            target_version: target_root.version.clone(),
            pages: Vec::new(),
        };
        for key in keys {
            let old = source_index.by_key.get(key).copied();
            let new = target_index.by_key.get(key).copied();
            let page = match (old, new) {
                (Some(old), Some(new)) if old.is_value_set() != new.is_value_set() => {
                    return Err(ArtifactError::unprocessable(WRONG_TYPE));
                }
                _ if old.or(new).is_some_and(KnowledgeArtifact::is_value_set) => {
                    self.value_set_page(old.map(|vs| (vs, source)), new.map(|vs| (vs, target)))?
                }
                _ => self.artifact_page(old, new)?,
            };
            changelog.pages.push(page);
        }

        tracing::info!(
            manifest = %changelog.manifest_url,
            pages = changelog.pages.len(),
            operations = changelog.operation_count(),
            "computed artifact diff"
        );
        Ok(changelog)
    }

    fn value_set_page(
        &self,
        old: Option<(&KnowledgeArtifact, &DependencyGraph)>,
        new: Option<(&KnowledgeArtifact, &DependencyGraph)>,
    ) -> Result<Page, ArtifactError> {
        let mut old_data = old.map(|(vs, graph)| self.value_set_snapshot(vs, graph));
        let mut new_data = new.map(|(vs, graph)| self.value_set_snapshot(vs, graph));
        let grouper = [&old_data, &new_data]
            .into_iter()
            .flatten()
            .any(|snapshot| snapshot.grouper);
        let mut ops = Vec::new();

        match (old_data.as_mut(), new_data.as_mut()) {
            (Some(old_vs), Some(new_vs)) => {
                if grouper {
                    for (field, old_value, new_value) in [
                        ("name", &old_vs.name, &new_vs.name),
                        ("title", &old_vs.title, &new_vs.title),
                        ("version", &old_vs.version, &new_vs.version),
                        ("priority", &old_vs.priority, &new_vs.priority),
                    ] {
                        if let Some(op) = field_operation(String::new(), field, old_value, new_value)
                        {
                            old_vs.changes.insert(field.to_string(), op.op);
                            new_vs.changes.insert(field.to_string(), op.op);
                            ops.push(op);
                        }
                    }
                    if old_vs.url != new_vs.url {
                        old_vs.changes.insert("url".into(), DiffOperationType::Replace);
                        new_vs.changes.insert("url".into(), DiffOperationType::Replace);
                        ops.push(replace("/url".into(), &old_vs.url, &new_vs.url));
                    }
                }
                self.align_leaves(grouper, &mut old_vs.leaves, &mut new_vs.leaves, &mut ops)?;
                inherit_operation(old_vs);
                inherit_operation(new_vs);
            }
            (Some(only), None) => {
                self.mark_value_set(only, DiffOperationType::Delete, &mut ops)?;
            }
            (None, Some(only)) => {
                self.mark_value_set(only, DiffOperationType::Insert, &mut ops)?;
            }
            (None, None) => {}
        }

        let url = old
            .or(new)
            .map(|(vs, _)| vs.url.clone())
            .unwrap_or_default();
        Ok(Page {
            url,
            resource_type: "ValueSet".into(),
            old_data: old_data.map(PageData::ValueSet),
            new_data: new_data.map(PageData::ValueSet),
            operations: ops,
        })
    }

    fn align_leaves(
        &self,
        grouper: bool,
        old_leaves: &mut [LeafSnapshot],
        new_leaves: &mut [LeafSnapshot],
        ops: &mut Vec<DiffOperation>,
    ) -> Result<(), ArtifactError> {
        let new_positions: HashMap<String, usize> = new_leaves
            .iter()
            .enumerate()
            .map(|(idx, leaf)| (leaf.key.clone(), idx))
            .collect();
        let mut matched = HashSet::new();
        for old_leaf in old_leaves.iter_mut() {
            let prefix = leaf_prefix(grouper, &old_leaf.key);
            match new_positions.get(&old_leaf.key) {
                Some(&idx) => {
                    matched.insert(idx);
                    self.diff_leaf(&prefix, old_leaf, &mut new_leaves[idx], ops);
                }
                None => self.mark_leaf(&prefix, old_leaf, DiffOperationType::Delete, ops)?,
            }
        }
        for (idx, new_leaf) in new_leaves.iter_mut().enumerate() {
            if !matched.contains(&idx) {
                let prefix = leaf_prefix(grouper, &new_leaf.key);
                self.mark_leaf(&prefix, new_leaf, DiffOperationType::Insert, ops)?;
            }
        }
        Ok(())
    }

    fn diff_leaf(
        &self,
        prefix: &str,
        old: &mut LeafSnapshot,
        new: &mut LeafSnapshot,
        ops: &mut Vec<DiffOperation>,
    ) {
        for (field, old_value, new_value) in [
            ("name", &old.name, &new.name),
            ("version", &old.version, &new.version),
            ("priority", &old.priority, &new.priority),
        ] {
            if let Some(op) = field_operation(prefix.to_string(), field, old_value, new_value) {
                old.changes.insert(field.to_string(), op.op);
                new.changes.insert(field.to_string(), op.op);
                ops.push(op);
            }
        }
        if old.url != new.url {
            old.changes.insert("url".into(), DiffOperationType::Replace);
            new.changes.insert("url".into(), DiffOperationType::Replace);
            ops.push(replace(format!("{prefix}/url"), &old.url, &new.url));
        }

        if self.options.computable() {
            diff_entries(
                &format!("{prefix}/codes"),
                &mut old.codes,
                &mut new.codes,
                CodeEntry::coded_key,
                ops,
            );
        }
        diff_entries(
            &format!("{prefix}/conditions"),
            &mut old.conditions,
            &mut new.conditions,
            |entry| entry.code.clone(),
            ops,
        );
        if self.options.compare_executable {
            diff_entries(
                &format!("{prefix}/expansion"),
                &mut old.expansion,
                &mut new.expansion,
                CodeEntry::coded_key,
                ops,
            );
        }
    }

    /// One operation for the leaf itself and one per code it carries.
    fn mark_leaf(
        &self,
        prefix: &str,
        leaf: &mut LeafSnapshot,
        op: DiffOperationType,
        ops: &mut Vec<DiffOperation>,
    ) -> Result<(), ArtifactError> {
        leaf.operation = Some(op);
        for field in ["name", "title", "url", "version", "priority", "conditions"] {
            leaf.changes.insert(field.to_string(), op);
        }
        for condition in &mut leaf.conditions {
            condition.operation = Some(op);
        }
        let path = if prefix.is_empty() { "/".to_string() } else { prefix.to_string() };
        ops.push(DiffOperation::one_sided(op, path, serde_json::to_value(&*leaf)?));

        if self.options.computable() {
            for code in &mut leaf.codes {
                code.operation = Some(op);
                ops.push(DiffOperation::one_sided(
                    op,
                    format!("{prefix}/codes/{}", code.coded_key()),
                    json!(code.code),
                ));
            }
        }
        if self.options.compare_executable {
            for code in &mut leaf.expansion {
                code.operation = Some(op);
                ops.push(DiffOperation::one_sided(
                    op,
                    format!("{prefix}/expansion/{}", code.coded_key()),
                    json!(code.code),
                ));
            }
        }
        Ok(())
    }

    fn mark_value_set(
        &self,
        snapshot: &mut ValueSetSnapshot,
        op: DiffOperationType,
        ops: &mut Vec<DiffOperation>,
    ) -> Result<(), ArtifactError> {
        snapshot.operation = Some(op);
        if snapshot.grouper {
            for field in ["name", "title", "url", "version", "priority"] {
                snapshot.changes.insert(field.to_string(), op);
            }
            ops.push(DiffOperation::one_sided(
                op,
                "/".into(),
                json!({ "url": snapshot.url, "version": snapshot.version }),
            ));
        }
        let grouper = snapshot.grouper;
        for leaf in &mut snapshot.leaves {
            let prefix = leaf_prefix(grouper, &leaf.key);
            self.mark_leaf(&prefix, leaf, op, ops)?;
        }
        Ok(())
    }

    fn artifact_page(
        &self,
        old: Option<&KnowledgeArtifact>,
        new: Option<&KnowledgeArtifact>,
    ) -> Result<Page, ArtifactError> {
        let mut old_data = old.map(artifact_snapshot);
        let mut new_data = new.map(artifact_snapshot);
        let mut ops = Vec::new();

        match (old_data.as_mut(), new_data.as_mut()) {
            (Some(old_art), Some(new_art)) => {
                let old_status = Some(old_art.status.clone());
                let new_status = Some(new_art.status.clone());
                for (field, old_value, new_value) in [
                    ("name", &old_art.name, &new_art.name),
                    ("title", &old_art.title, &new_art.title),
                    ("version", &old_art.version, &new_art.version),
                    ("status", &old_status, &new_status),
                ] {
                    if let Some(op) = field_operation(String::new(), field, old_value, new_value) {
                        old_art.changes.insert(field.to_string(), op.op);
                        new_art.changes.insert(field.to_string(), op.op);
                        ops.push(op);
                    }
                }
                if old_art.url != new_art.url {
                    old_art.changes.insert("url".into(), DiffOperationType::Replace);
                    new_art.changes.insert("url".into(), DiffOperationType::Replace);
                    ops.push(replace("/url".into(), &old_art.url, &new_art.url));
                }
                diff_related(
                    &mut old_art.related_artifacts,
                    &mut new_art.related_artifacts,
                    &mut ops,
                );
            }
            (Some(only), None) => mark_artifact(only, DiffOperationType::Delete, &mut ops),
            (None, Some(only)) => mark_artifact(only, DiffOperationType::Insert, &mut ops),
            (None, None) => {}
        }

        let template = old.or(new);
        Ok(Page {
            url: template.map(|a| a.url.clone()).unwrap_or_default(),
            resource_type: template
                .map(|a| a.resource_type.clone())
                .unwrap_or_default(),
            old_data: old_data.map(PageData::Artifact),
            new_data: new_data.map(PageData::Artifact),
            operations: ops,
        })
    }

    fn value_set_snapshot(&self, vs: &KnowledgeArtifact, graph: &DependencyGraph) -> ValueSetSnapshot {
        let mut visiting = Vec::new();
        let mut leaves = Vec::new();
        collect_leaves(graph, vs, &mut visiting, &mut leaves);
        let mut seen = HashSet::new();
        let leaves = leaves
            .into_iter()
            .filter(|leaf| seen.insert(identity_key(leaf)))
            .map(|leaf| self.leaf_snapshot(leaf))
            .collect();
        ValueSetSnapshot {
            url: vs.url.clone(),
            name: vs.name.clone(),
            title: vs.title.clone(),
            version: vs.version.clone(),
            priority: vs.priority().map(str::to_string),
            grouper: vs.is_grouper_value_set(),
            leaves,
            operation: None,
            changes: BTreeMap::new(),
        }
    }

    fn leaf_snapshot(&self, leaf: &KnowledgeArtifact) -> LeafSnapshot {
        let mut code_systems = Vec::new();
        let mut codes = Vec::new();
        for include in leaf.compose.iter().flat_map(|c| c.include.iter()) {
            if include.concept.is_empty() {
                continue;
            }
            if let Some(system) = &include.system {
                if !code_systems.contains(system) {
                    code_systems.push(system.clone());
                }
            }
            for concept in &include.concept {
                codes.push(CodeEntry {
                    system: include.system.clone(),
                    code: concept.code.clone(),
                    display: concept.display.clone(),
                    operation: None,
                });
            }
        }
        code_systems.sort();

        let conditions = leaf
            .conditions()
            .into_iter()
            .filter_map(|coding| {
                coding.code.as_ref().map(|code| CodeEntry {
                    system: coding.system.clone(),
                    code: code.clone(),
                    display: coding.display.clone(),
                    operation: None,
                })
            })
            .collect();

        let expansion = if self.options.compare_executable {
            self.expansion_for(leaf)
                .contains
                .into_iter()
                .map(|contains| CodeEntry {
                    system: contains.system,
                    code: contains.code,
                    display: contains.display,
                    operation: None,
                })
                .collect()
        } else {
            Vec::new()
        };

        LeafSnapshot {
            key: identity_key(leaf).to_string(),
            url: leaf.url.clone(),
            name: leaf.name.clone(),
            title: leaf.title.clone(),
            version: leaf.version.clone(),
            code_systems,
            codes,
            conditions,
            priority: leaf.priority().map(str::to_string),
            expansion,
            operation: None,
            changes: BTreeMap::new(),
        }
    }

    /// Attached expansion, then a cached one, then the naive union of compose codes.
    fn expansion_for(&self, leaf: &KnowledgeArtifact) -> Expansion {
        if let Some(expansion) = &leaf.expansion {
            return expansion.clone();
        }
        if let Some(cache) = self.cache {
            let key = CacheKey::new(leaf.canonical(), params_hash(&[]));
            if let Some(expansion) = cache.get(&key) {
                return expansion;
            }
        }
        naive_expansion(leaf)
    }
}

struct ArtifactIndex<'g> {
    order: Vec<&'g str>,
    by_key: HashMap<&'g str, &'g KnowledgeArtifact>,
}

fn index_artifacts(graph: &DependencyGraph) -> ArtifactIndex<'_> {
    let mut order = Vec::new();
    let mut by_key = HashMap::new();
    for artifact in graph.nodes().iter().filter_map(|node| node.artifact.as_ref()) {
        let key = identity_key(artifact);
        if !by_key.contains_key(key) {
            order.push(key);
            by_key.insert(key, artifact);
        }
    }
    ArtifactIndex { order, by_key }
}

fn collect_leaves<'g>(
    graph: &'g DependencyGraph,
    vs: &'g KnowledgeArtifact,
    visiting: &mut Vec<String>,
    leaves: &mut Vec<&'g KnowledgeArtifact>,
) {
    if vs.is_leaf_value_set() {
        leaves.push(vs);
        return;
    }
    let key = vs.canonical().key();
    if visiting.contains(&key) {
        return;
    }
    visiting.push(key);
    for include in vs.value_set_includes() {
        let Ok(reference) = CanonicalReference::parse(&include) else {
            continue;
        };
        match locate(graph, &reference) {
            Some(child) => collect_leaves(graph, child, visiting, leaves),
            None => tracing::debug!(grouper = %vs.url, include = %reference, "child value set not in graph"),
        }
    }
    visiting.pop();
}

fn locate<'g>(graph: &'g DependencyGraph, reference: &CanonicalReference) -> Option<&'g KnowledgeArtifact> {
    if let Some(artifact) = graph
        .find(reference)
        .and_then(|id| graph.node(id).artifact.as_ref())
    {
        return Some(artifact);
    }
    graph
        .nodes()
        .iter()
        .filter_map(|node| node.artifact.as_ref())
        .find(|artifact| {
            let canonical = artifact.canonical();
            canonical.same_url(reference)
                && (reference.version().is_none() || reference.version() == canonical.version())
        })
}

/// True when `path` addresses a grouper leaf whose key is in `paged`.
fn repeats_paged_leaf(path: &str, paged: &HashSet<&str>) -> bool {
    let Some(rest) = path.strip_prefix("/leaves/") else {
        return false;
    };
    paged.iter().any(|key| {
        rest.strip_prefix(key)
            .is_some_and(|tail| tail.is_empty() || tail.starts_with('/'))
    })
}

fn leaf_prefix(grouper: bool, key: &str) -> String {
    if grouper { format!("/leaves/{key}") } else { String::new() }
}

fn replace(path: String, old: &str, new: &str) -> DiffOperation {
    DiffOperation {
        op: DiffOperationType::Replace,
        path,
        old_value: Some(json!(old)),
        new_value: Some(json!(new)),
    }
}

fn field_operation(
    prefix: String,
    field: &str,
    old: &Option<String>,
    new: &Option<String>,
) -> Option<DiffOperation> {
    let path = format!("{prefix}/{field}");
    match (old, new) {
        (Some(old), Some(new)) if old != new => Some(replace(path, old, new)),
        (Some(old), None) => Some(DiffOperation::delete(path, json!(old))),
        (None, Some(new)) => Some(DiffOperation::insert(path, json!(new))),
        _ => None,
    }
}

/// Set difference by `key`; entries present on both sides are unchanged.
fn diff_entries(
    prefix: &str,
    old: &mut [CodeEntry],
    new: &mut [CodeEntry],
    key: impl Fn(&CodeEntry) -> String,
    ops: &mut Vec<DiffOperation>,
) {
    let old_keys: HashSet<String> = old.iter().map(&key).collect();
    let new_keys: HashSet<String> = new.iter().map(&key).collect();
    for entry in old.iter_mut() {
        let entry_key = key(entry);
        if !new_keys.contains(&entry_key) {
            entry.operation = Some(DiffOperationType::Delete);
            ops.push(DiffOperation::delete(
                format!("{prefix}/{entry_key}"),
                json!(entry.code),
            ));
        }
    }
    for entry in new.iter_mut() {
        let entry_key = key(entry);
        if !old_keys.contains(&entry_key) {
            entry.operation = Some(DiffOperationType::Insert);
            ops.push(DiffOperation::insert(
                format!("{prefix}/{entry_key}"),
                json!(entry.code),
            ));
        }
    }
}

/// A snapshot whose leaves were all inserted (or all deleted) takes that operation itself.
fn inherit_operation(snapshot: &mut ValueSetSnapshot) {
    if !snapshot.grouper || snapshot.leaves.is_empty() {
        return;
    }
    let first = snapshot.leaves[0].operation;
    if matches!(
        first,
        Some(DiffOperationType::Insert) | Some(DiffOperationType::Delete)
    ) && snapshot.leaves.iter().all(|leaf| leaf.operation == first)
    {
        snapshot.operation = first;
    }
}

fn artifact_snapshot(artifact: &KnowledgeArtifact) -> ArtifactSnapshot {
    ArtifactSnapshot {
        resource_type: artifact.resource_type.clone(),
        url: artifact.url.clone(),
        name: artifact.name.clone(),
        title: artifact.title.clone(),
        version: artifact.version.clone(),
        status: artifact.status.to_string(),
        related_artifacts: artifact
            .related_artifact
            .iter()
            .filter_map(|related| {
                related.resource.as_ref().map(|resource| RelatedEntry {
                    resource: resource.clone(),
                    relation: serde_json::to_value(related.relation)
                        .ok()
                        .and_then(|value| value.as_str().map(str::to_string))
                        .unwrap_or_default(),
                    operation: None,
                })
            })
            .collect(),
        operation: None,
        changes: BTreeMap::new(),
    }
}

fn related_key(entry: &RelatedEntry) -> String {
    CanonicalReference::parse(&entry.resource)
        .map(|reference| reference.url_key().to_string())
        .unwrap_or_else(|_| entry.resource.clone())
}

fn diff_related(old: &mut [RelatedEntry], new: &mut [RelatedEntry], ops: &mut Vec<DiffOperation>) {
    let new_by_key: HashMap<String, usize> = new
        .iter()
        .enumerate()
        .map(|(idx, entry)| (related_key(entry), idx))
        .collect();
    let mut matched = HashSet::new();
    for entry in old.iter_mut() {
        let key = related_key(entry);
        match new_by_key.get(&key) {
            Some(&idx) => {
                matched.insert(idx);
                let counterpart = &mut new[idx];
                if counterpart.resource != entry.resource {
                    entry.operation = Some(DiffOperationType::Replace);
                    counterpart.operation = Some(DiffOperationType::Replace);
                    ops.push(replace(
                        format!("/relatedArtifact/{key}"),
                        &entry.resource,
                        &counterpart.resource,
                    ));
                }
            }
            None => {
                entry.operation = Some(DiffOperationType::Delete);
                ops.push(DiffOperation::delete(
                    format!("/relatedArtifact/{key}"),
                    json!(entry.resource),
                ));
            }
        }
    }
    for (idx, entry) in new.iter_mut().enumerate() {
        if !matched.contains(&idx) {
            entry.operation = Some(DiffOperationType::Insert);
            ops.push(DiffOperation::insert(
                format!("/relatedArtifact/{}", related_key(entry)),
                json!(entry.resource),
            ));
        }
    }
}

fn mark_artifact(snapshot: &mut ArtifactSnapshot, op: DiffOperationType, ops: &mut Vec<DiffOperation>) {
    snapshot.operation = Some(op);
    for field in ["name", "title", "url", "version", "status"] {
        snapshot.changes.insert(field.to_string(), op);
    }
    ops.push(DiffOperation::one_sided(
        op,
        "/".into(),
        json!({ "url": snapshot.url, "version": snapshot.version }),
    ));
    for entry in &mut snapshot.related_artifacts {
        entry.operation = Some(op);
        ops.push(DiffOperation::one_sided(
            op,
            format!("/relatedArtifact/{}", related_key(entry)),
            json!(entry.resource),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ArtifactStatus, CodeableConcept, Coding, Compose, Concept, ConceptSet, CONDITION_CODE,
        ExpansionContains, RelatedArtifact, RelationType, US_PH_USAGE_CONTEXT_SYSTEM, UsageContext,
    };
    use crate::repository::InMemoryRepository;

    const VS_BASE: &str = "http://cts.nlm.nih.gov/fhir/ValueSet";

    fn leaf(oid: &str, codes: &[&str]) -> KnowledgeArtifact {
        let mut vs = KnowledgeArtifact::new("ValueSet", &format!("{VS_BASE}/{oid}"), Some("1.0.0"));
        vs.name = Some(format!("Leaf{}", oid.rsplit('.').next().unwrap_or_default()));
        vs.status = ArtifactStatus::Active;
        vs.compose = Some(Compose {
            include: vec![ConceptSet {
                system: Some("http://snomed.info/sct".into()),
                concept: codes
                    .iter()
                    .map(|code| Concept {
                        code: code.to_string(),
                        display: None,
                    })
                    .collect(),
                ..Default::default()
            }],
        });
        vs
    }

    fn grouper(version: &str, leaves: &[&str]) -> KnowledgeArtifact {
        let mut vs =
            KnowledgeArtifact::new("ValueSet", "http://ex.org/ValueSet/grouper", Some(version));
        vs.name = Some("Grouper".into());
        vs.compose = Some(Compose {
            include: vec![ConceptSet {
                value_set: leaves
                    .iter()
                    .map(|oid| format!("{VS_BASE}/{oid}|1.0.0"))
                    .collect(),
                ..Default::default()
            }],
        });
        vs
    }

    fn manifest(version: &str, grouper_version: &str) -> KnowledgeArtifact {
        let mut library =
            KnowledgeArtifact::new("Library", "http://ex.org/Library/manifest", Some(version));
        library.title = Some("Manifest".into());
        library.related_artifact = vec![RelatedArtifact::new(
            RelationType::DependsOn,
            format!("http://ex.org/ValueSet/grouper|{grouper_version}"),
        )];
        library
    }

    /// v1 groups leaves 1-3; v2 drops 3 and adds 4 and 5.
    fn repository() -> InMemoryRepository {
        InMemoryRepository::with_artifacts([
            manifest("1.0.0", "1.0.0"),
            manifest("2.0.0", "2.0.0"),
            grouper("1.0.0", &["2.16.1", "2.16.2", "2.16.3"]),
            grouper("2.0.0", &["2.16.1", "2.16.2", "2.16.4", "2.16.5"]),
            leaf("2.16.1", &["a1", "a2"]),
            leaf("2.16.2", &["b1", "b2"]),
            leaf("2.16.3", &["c1", "c2"]),
            leaf("2.16.4", &["d1", "d2"]),
            leaf("2.16.5", &["e1", "e2"]),
        ])
        .unwrap()
    }

    fn reference(raw: &str) -> CanonicalReference {
        CanonicalReference::parse(raw).unwrap()
    }

    fn diff(source: &str, target: &str, options: DiffOptions) -> ChangeLog {
        let repository = repository();
        ArtifactDiffEngine::new(options)
            .diff_references(&repository, &reference(source), &reference(target))
            .unwrap()
    }

    #[test]
    fn identical_snapshots_have_no_operations() {
        let changelog = diff(
            "http://ex.org/Library/manifest|1.0.0",
            "http://ex.org/Library/manifest|1.0.0",
            DiffOptions::default(),
        );
        assert_eq!(changelog.operation_count(), 0);
        assert_eq!(changelog.pages.len(), 5);
    }

    #[test]
    fn grouper_page_counts_dropped_and_added_leaves() {
        let changelog = diff(
            "http://ex.org/Library/manifest|1.0.0",
            "http://ex.org/Library/manifest|2.0.0",
            DiffOptions::default(),
        );
        let groupers: Vec<&Page> = changelog.pages.iter().filter(|p| p.is_grouper()).collect();
        assert_eq!(groupers.len(), 1);
        let page = groupers[0];
        assert_eq!(page.count(DiffOperationType::Delete), 1 + 2);
        assert_eq!(page.count(DiffOperationType::Insert), 2 + 4);
        assert_eq!(page.count(DiffOperationType::Replace), 1);

        let Some(PageData::ValueSet(old)) = &page.old_data else {
            panic!("grouper page without old data");
        };
        let dropped = old.leaves.iter().find(|l| l.key == "2.16.3").unwrap();
        assert_eq!(dropped.operation, Some(DiffOperationType::Delete));
        assert!(dropped.codes.iter().all(|c| c.operation == Some(DiffOperationType::Delete)));
        assert!(old.operation.is_none());

        let removed_page = changelog.page(&format!("{VS_BASE}/2.16.3")).unwrap();
        assert!(removed_page.new_data.is_none());
        assert_eq!(removed_page.count(DiffOperationType::Delete), 3);
    }

    #[test]
    fn totals_count_leaf_changes_once() {
        let changelog = diff(
            "http://ex.org/Library/manifest|1.0.0",
            "http://ex.org/Library/manifest|2.0.0",
            DiffOptions::default(),
        );
        let page_sum = |op| changelog.pages.iter().map(|page| page.count(op)).sum::<usize>();
        assert_eq!(page_sum(DiffOperationType::Insert), 12);
        assert_eq!(page_sum(DiffOperationType::Delete), 6);

        assert_eq!(changelog.count(DiffOperationType::Insert), 6);
        assert_eq!(changelog.count(DiffOperationType::Delete), 3);
        assert_eq!(changelog.count(DiffOperationType::Replace), 1 + 2);
        assert!(changelog.operations().all(|op| !op.path.starts_with("/leaves/")));
    }

    #[test]
    fn reversed_diff_swaps_inserts_and_deletes() {
        let forward = diff(
            "http://ex.org/Library/manifest|1.0.0",
            "http://ex.org/Library/manifest|2.0.0",
            DiffOptions::default(),
        );
        let backward = diff(
            "http://ex.org/Library/manifest|2.0.0",
            "http://ex.org/Library/manifest|1.0.0",
            DiffOptions::default(),
        );
        assert_eq!(forward.operation_count(), backward.operation_count());
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
    }

    #[test]
    fn library_page_reports_version_and_dependency_changes() {
        let changelog = diff(
            "http://ex.org/Library/manifest|1.0.0",
            "http://ex.org/Library/manifest|2.0.0",
            DiffOptions::default(),
        );
        let page = changelog.page("http://ex.org/Library/manifest").unwrap();
        let paths: Vec<&str> = page.operations.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["/version", "/relatedArtifact/http://ex.org/ValueSet/grouper"]
        );
        assert!(page.operations.iter().all(|o| o.op == DiffOperationType::Replace));
    }

    #[test]
    fn leaves_align_by_oid_and_diff_metadata() {
        let mut old_leaf = leaf("2.16.9", &["x1", "x2"]);
        old_leaf.use_context.push(UsageContext {
            code: Coding::new(US_PH_USAGE_CONTEXT_SYSTEM, CONDITION_CODE),
            value_codeable_concept: Some(CodeableConcept {
                coding: vec![Coding::new("http://snomed.info/sct", "840539006")],
                text: None,
            }),
            value_reference: None,
        });
        let mut new_leaf = leaf("2.16.9", &["x2", "x3"]);
        new_leaf.url = "https://vsac.example.org/fhir/ValueSet/2.16.9".into();
        new_leaf.version = Some("2.0.0".into());

        let old_repo = InMemoryRepository::with_artifacts([old_leaf.clone()]).unwrap();
        let new_repo = InMemoryRepository::with_artifacts([new_leaf.clone()]).unwrap();
        let walker_old = DependencyGraphWalker::new(&old_repo, WalkOptions::transitive());
        let walker_new = DependencyGraphWalker::new(&new_repo, WalkOptions::transitive());
        let old_graph = walker_old.collect(&old_leaf.canonical()).unwrap();
        let new_graph = walker_new.collect(&new_leaf.canonical()).unwrap();

        let err = ArtifactDiffEngine::new(DiffOptions::default())
            .diff(&old_graph, &new_graph)
            .expect_err("root urls differ");
        assert_eq!(err.to_string(), format!("unprocessable entity: {URLS_DONT_MATCH}"));

        let engine = ArtifactDiffEngine::new(DiffOptions::default());
        let mut page_ops = Vec::new();
        let mut old_snapshot = engine.leaf_snapshot(&old_leaf);
        let mut new_snapshot = engine.leaf_snapshot(&new_leaf);
        assert_eq!(old_snapshot.key, new_snapshot.key);
        engine.diff_leaf("", &mut old_snapshot, &mut new_snapshot, &mut page_ops);

        let paths: Vec<&str> = page_ops.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/version",
                "/url",
                "/codes/http://snomed.info/sct|x1",
                "/codes/http://snomed.info/sct|x3",
                "/conditions/840539006",
            ]
        );
        assert_eq!(old_snapshot.changes.get("url"), Some(&DiffOperationType::Replace));
    }

    #[test]
    fn executable_mode_diffs_expansion_membership() {
        let mut old_leaf = leaf("2.16.7", &["k1"]);
        old_leaf.expansion = Some(Expansion {
            contains: vec![ExpansionContains {
                system: Some("http://snomed.info/sct".into()),
                code: "k1".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        let mut new_leaf = old_leaf.clone();
        new_leaf.version = Some("1.0.1".into());
        if let Some(expansion) = new_leaf.expansion.as_mut() {
            expansion.contains.push(ExpansionContains {
                system: Some("http://snomed.info/sct".into()),
                code: "k2".into(),
                ..Default::default()
            });
        }

        let repository = InMemoryRepository::with_artifacts([old_leaf.clone(), new_leaf.clone()]).unwrap();
        let computable = ArtifactDiffEngine::new(DiffOptions {
            compare_computable: true,
            compare_executable: false,
        })
        .diff_references(&repository, &old_leaf.canonical(), &new_leaf.canonical())
        .unwrap();
        let executable = ArtifactDiffEngine::new(DiffOptions {
            compare_computable: true,
            compare_executable: true,
        })
        .diff_references(&repository, &old_leaf.canonical(), &new_leaf.canonical())
        .unwrap();

        assert_eq!(computable.operation_count(), 1);
        assert_eq!(executable.operation_count(), 2);
        assert_eq!(executable.count(DiffOperationType::Insert), 1);
    }

    #[test]
    fn mismatched_root_types_are_rejected() {
        let library = KnowledgeArtifact::new("Library", "http://ex.org/shared", Some("1"));
        let plan = KnowledgeArtifact::new("PlanDefinition", "http://ex.org/shared", Some("2"));
        let repository = InMemoryRepository::with_artifacts([library.clone(), plan.clone()]).unwrap();
        let err = ArtifactDiffEngine::new(DiffOptions::default())
            .diff_references(&repository, &library.canonical(), &plan.canonical())
            .expect_err("types differ");
        assert!(err.to_string().ends_with(WRONG_TYPE));
    }
}
