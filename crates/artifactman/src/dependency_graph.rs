use std::collections::{BTreeSet, HashMap, VecDeque};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};

use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;
use crate::model::{Extension, KnowledgeArtifact, RelationType};
use crate::repository::ArtifactRepository;

pub type NodeId = usize;

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct GraphNode {
    pub reference: CanonicalReference,
    pub artifact: Option<KnowledgeArtifact>,
    pub depth: usize,
}

impl GraphNode {
    pub fn is_resolved(&self) -> bool {
        self.artifact.is_some()
    }

    /// Resolved canonical when available, the declared reference otherwise.
    pub fn canonical(&self) -> CanonicalReference {
        self.artifact
            .as_ref()
            .map(KnowledgeArtifact::canonical)
            .unwrap_or_else(|| self.reference.clone())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct GraphEdge {
    pub source: NodeId,
    pub target: NodeId,
    pub relation: RelationType,
    pub owned: bool,
    pub extensions: Vec<Extension>,
}

/// Per-url version overrides applied while resolving references.
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VersionOverrides {
    #[serde(default)]
    pub artifact_version: Vec<CanonicalReference>,
    #[serde(default)]
    pub check_artifact_version: Vec<CanonicalReference>,
    #[serde(default)]
    pub force_artifact_version: Vec<CanonicalReference>,
}

impl VersionOverrides {
    pub fn is_empty(&self) -> bool {
        self.artifact_version.is_empty()
            && self.check_artifact_version.is_empty()
            && self.force_artifact_version.is_empty()
    }

    /// Reference to look up after applying force, check and default overrides in that order.
    pub fn apply(&self, reference: &CanonicalReference) -> Result<CanonicalReference, ArtifactError> {
        let matching = |list: &[CanonicalReference]| {
            list.iter()
                .find(|candidate| candidate.same_url(reference) && candidate.version().is_some())
                .cloned()
        };

        if let Some(forced) = matching(&self.force_artifact_version) {
            return Ok(reference.with_version(forced.version()));
        }
        if let Some(checked) = matching(&self.check_artifact_version) {
            if let (Some(actual), Some(expected)) = (reference.version(), checked.version()) {
                if actual != expected {
                    return Err(ArtifactError::Precondition(format!(
                        "Resource with url '{}' has version '{actual}' but checkVersion specifies '{expected}'",
                        reference.url()
                    )));
                }
            }
            return Ok(reference.with_version(checked.version()));
        }
        if reference.version().is_none() {
            if let Some(default) = matching(&self.artifact_version) {
                return Ok(reference.with_version(default.version()));
            }
        }
        Ok(reference.clone())
    }
}

#[derive(Clone, Debug, Default)]
pub struct WalkOptions {
    /// Expand the targets of unowned edges too.
    pub follow_unowned: bool,
    pub overrides: VersionOverrides,
}

impl WalkOptions {
    pub fn owned_only() -> Self {
        Self::default()
    }

    pub fn transitive() -> Self {
        Self {
            follow_unowned: true,
            ..Self::default()
        }
    }
}

/// Split of the non-root nodes into components and dependencies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub components: Vec<NodeId>,
    pub dependencies: Vec<NodeId>,
}

/// Arena of artifacts reachable from a root; node 0 is always the root.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "GraphRecord")]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    #[serde(rename = "aliases", serialize_with = "serialize_index")]
    index: HashMap<CanonicalReference, NodeId>,
}

fn serialize_index<S: Serializer>(
    index: &HashMap<CanonicalReference, NodeId>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut aliases: Vec<_> = index.iter().collect();
    aliases.sort();
    aliases.serialize(serializer)
}

/// Serialized form of a [`DependencyGraph`]; the lookup index is restored on load.
#[derive(Deserialize)]
struct GraphRecord {
    nodes: Vec<GraphNode>,
    #[serde(default)]
    edges: Vec<GraphEdge>,
    #[serde(default)]
    aliases: Vec<(CanonicalReference, NodeId)>,
}

impl From<GraphRecord> for DependencyGraph {
    fn from(record: GraphRecord) -> Self {
        let node_count = record.nodes.len();
        let mut index: HashMap<CanonicalReference, NodeId> = record
            .aliases
            .into_iter()
            .filter(|(_, id)| *id < node_count)
            .collect();
        for (id, node) in record.nodes.iter().enumerate() {
            index.entry(node.reference.clone()).or_insert(id);
            if let Some(resolved) = node.artifact.as_ref().map(KnowledgeArtifact::canonical) {
                index.entry(resolved).or_insert(id);
            }
        }
        Self {
            nodes: record.nodes,
            edges: record.edges,
            index,
        }
    }
}

impl DependencyGraph {
    pub const ROOT: NodeId = 0;

    pub fn root(&self) -> &GraphNode {
        &self.nodes[Self::ROOT]
    }

    /// Resolved root artifact.
    pub fn root_artifact(&self) -> Result<&KnowledgeArtifact, ArtifactError> {
        self.nodes
            .first()
            .and_then(|node| node.artifact.as_ref())
            .ok_or_else(|| ArtifactError::NotFound("dependency graph has no root".into()))
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, reference: &CanonicalReference) -> Option<NodeId> {
        self.index.get(reference).copied()
    }

    pub fn edges_from(&self, source: NodeId) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter().filter(move |edge| edge.source == source)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter().filter(|node| !node.is_resolved())
    }

    /// Components are reachable from the root through composed-of edges; every other node is a dependency.
    pub fn classify(&self) -> Classification {
        let mut seen = BTreeSet::from([Self::ROOT]);
        let mut queue = VecDeque::from([Self::ROOT]);
        while let Some(current) = queue.pop_front() {
            for edge in self.edges_from(current) {
                if edge.relation == RelationType::ComposedOf && seen.insert(edge.target) {
                    queue.push_back(edge.target);
                }
            }
        }

        let mut classification = Classification::default();
        for id in 1..self.nodes.len() {
            if seen.contains(&id) {
                classification.components.push(id);
            } else {
                classification.dependencies.push(id);
            }
        }
        classification
    }

    /// Nodes reachable from the root through owned edges only, in discovery order.
    pub fn owned_descendants(&self) -> Vec<NodeId> {
        let mut seen = BTreeSet::from([Self::ROOT]);
        let mut stack = vec![Self::ROOT];
        let mut ordered = Vec::new();
        while let Some(current) = stack.pop() {
            let targets: Vec<NodeId> = self
                .edges_from(current)
                .filter(|edge| edge.owned)
                .map(|edge| edge.target)
                .collect();
            for target in targets.into_iter().rev() {
                if seen.insert(target) {
                    ordered.push(target);
                    stack.push(target);
                }
            }
        }
        ordered
    }

    fn insert(&mut self, reference: CanonicalReference, artifact: Option<KnowledgeArtifact>, depth: usize) -> NodeId {
        let id = self.nodes.len();
        self.index.insert(reference.clone(), id);
        if let Some(resolved) = artifact.as_ref().map(KnowledgeArtifact::canonical) {
            self.index.entry(resolved).or_insert(id);
        }
        self.nodes.push(GraphNode {
            reference,
            artifact,
            depth,
        });
        id
    }

    fn record_edge(&mut self, edge: GraphEdge) {
        let duplicate = self.edges.iter().any(|existing| {
            existing.source == edge.source
                && existing.target == edge.target
                && existing.relation == edge.relation
        });
        if !duplicate {
            self.edges.push(edge);
        }
    }
}

/// Outgoing dependency edges declared by an artifact.
struct DeclaredEdge {
    reference: CanonicalReference,
    relation: RelationType,
    owned: bool,
    extensions: Vec<Extension>,
}

fn declared_edges(artifact: &KnowledgeArtifact) -> Vec<DeclaredEdge> {
    let mut edges: Vec<DeclaredEdge> = artifact
        .related_artifact
        .iter()
        .filter(|related| related.relation.is_dependency_edge())
        .filter_map(|related| {
            related.reference().map(|reference| DeclaredEdge {
                reference,
                relation: related.relation,
                owned: related.is_owned(),
                extensions: related.extension.clone(),
            })
        })
        .collect();

    for include in artifact.value_set_includes() {
        if let Ok(reference) = CanonicalReference::parse(&include) {
            edges.push(DeclaredEdge {
                reference,
                relation: RelationType::DependsOn,
                owned: false,
                extensions: Vec::new(),
            });
        }
    }
    edges
}

/// Depth-first collector of the artifacts reachable from a root.
pub struct DependencyGraphWalker<'a, R: ArtifactRepository + ?Sized> {
    repository: &'a R,
    options: WalkOptions,
}

impl<'a, R: ArtifactRepository + ?Sized> DependencyGraphWalker<'a, R> {
    pub fn new(repository: &'a R, options: WalkOptions) -> Self {
        Self {
            repository,
            options,
        }
    }

    pub fn collect(&self, root: &CanonicalReference) -> Result<DependencyGraph, ArtifactError> {
        let artifact = self
            .repository
            .read(root)?
            .ok_or_else(|| ArtifactError::NotFound(format!("artifact '{root}' was not found")))?;

        let mut graph = DependencyGraph::default();
        let root_id = graph.insert(root.clone(), Some(artifact), 0);
        self.visit(&mut graph, root_id)?;
        tracing::debug!(
            root = %root,
            nodes = graph.len(),
            edges = graph.edges.len(),
            "collected dependency graph"
        );
        Ok(graph)
    }

    fn visit(&self, graph: &mut DependencyGraph, source: NodeId) -> Result<(), ArtifactError> {
        let Some(artifact) = graph.nodes[source].artifact.clone() else {
            return Ok(());
        };
        let depth = graph.nodes[source].depth + 1;

        for declared in declared_edges(&artifact) {
            let reference = self.options.overrides.apply(&declared.reference)?;
            let (target, fresh) = match graph.find(&reference) {
                Some(existing) => (existing, false),
                None => {
                    let resolved = self.resolve(&reference)?;
                    let existing = resolved
                        .as_ref()
                        .and_then(|found| graph.find(&found.canonical()));
                    match existing {
                        Some(existing) => {
                            graph.index.insert(reference.clone(), existing);
                            (existing, false)
                        }
                        None => (graph.insert(reference.clone(), resolved, depth), true),
                    }
                }
            };

            graph.record_edge(GraphEdge {
                source,
                target,
                relation: declared.relation,
                owned: declared.owned,
                extensions: declared.extensions,
            });

            if fresh && (declared.owned || self.options.follow_unowned) {
                self.visit(graph, target)?;
            }
        }
        Ok(())
    }

    fn resolve(&self, reference: &CanonicalReference) -> Result<Option<KnowledgeArtifact>, ArtifactError> {
        if reference.is_contained() {
            tracing::debug!(reference = %reference, "contained reference left unresolved");
            return Ok(None);
        }
        let found = self.repository.read(reference)?;
        if found.is_none() {
            tracing::warn!(reference = %reference, "related artifact could not be resolved");
        }
        Ok(found)
    }
}
