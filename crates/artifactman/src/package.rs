use std::collections::{HashMap, HashSet};

use crate::bundle::{Bundle, BundleEntry, BundleType, EntryRequest, HttpVerb, Issue, Resource};
use crate::canonical::CanonicalReference;
use crate::dependency_graph::{DependencyGraph, DependencyGraphWalker, VersionOverrides, WalkOptions};
use crate::error::ArtifactError;
use crate::expansion::ValueSetExpander;
use crate::expansion_cache::ExpansionCache;
use crate::ids;
use crate::model::{
    ExpansionParameter, INTENDED_USAGE_CONTEXT_URL, KNOWLEDGE_CAPABILITY_URL, KnowledgeArtifact,
    dependency_roles,
};
use crate::params::{ParameterMap, TerminologyEndpoint};
use crate::repository::ArtifactRepository;
use crate::terminology::{TerminologyProvider, require_credentials};

const KNOWLEDGE_TYPES: [&str; 5] = [
    "Library",
    "ActivityDefinition",
    "PlanDefinition",
    "Measure",
    "Questionnaire",
];
const TERMINOLOGY_TYPES: [&str; 4] = ["ValueSet", "CodeSystem", "ConceptMap", "NamingSystem"];
const CONFORMANCE_TYPES: [&str; 9] = [
    "StructureDefinition",
    "CapabilityStatement",
    "ImplementationGuide",
    "SearchParameter",
    "OperationDefinition",
    "CompartmentDefinition",
    "GraphDefinition",
    "StructureMap",
    "MessageDefinition",
];
const ROLE_FILTERS: [&str; 4] = ["key", "default", "example", "test"];

#[derive(Clone, Debug, Default)]
pub struct PackageParams {
    pub include: Vec<String>,
    pub capability: Vec<String>,
    pub count: Option<i64>,
    pub offset: Option<i64>,
    pub bundle_type: Option<BundleType>,
    pub overrides: VersionOverrides,
    pub terminology_endpoint: Option<TerminologyEndpoint>,
    pub expansion_parameters: Vec<ExpansionParameter>,
}

impl PackageParams {
    pub fn from_parameters(params: &ParameterMap) -> Result<Self, ArtifactError> {
        let mut expansion_parameters = Vec::new();
        for name in ["system-version", "valueset-version"] {
            for value in params.strings(name) {
                expansion_parameters.push(ExpansionParameter::string(name, value));
            }
        }
        Ok(Self {
            include: params.strings("include"),
            capability: params.strings("capability"),
            count: params.integer("count")?,
            offset: params.integer("offset")?,
            bundle_type: params.code("bundleType")?,
            overrides: VersionOverrides {
                artifact_version: params.canonicals("artifactVersion")?,
                check_artifact_version: params.canonicals("checkArtifactVersion")?,
                force_artifact_version: params.canonicals("forceArtifactVersion")?,
            },
            terminology_endpoint: params.endpoint().cloned(),
            expansion_parameters,
        })
    }

    fn validate(&self) -> Result<(), ArtifactError> {
        if self.count.is_some_and(|count| count < 0) {
            return Err(ArtifactError::Validation(
                "'count' must be greater than or equal to 0".into(),
            ));
        }
        if self.offset.is_some_and(|offset| offset < 0) {
            return Err(ArtifactError::Validation(
                "'offset' must be greater than or equal to 0".into(),
            ));
        }
        let paged = self.count.is_some() || self.offset.is_some();
        if paged
            && matches!(
                self.bundle_type,
                Some(BundleType::Transaction) | Some(BundleType::Collection)
            )
        {
            return Err(ArtifactError::Validation(format!(
                "'count' and 'offset' cannot be combined with bundleType '{}'",
                self.bundle_type.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

/// Builds filtered, paged bundles of an artifact and its transitive dependencies.
pub struct PackageAssembler<'a, R: ArtifactRepository + ?Sized> {
    repository: &'a R,
    cache: &'a ExpansionCache,
    terminology: Option<&'a dyn TerminologyProvider>,
}

struct Candidate {
    artifact: KnowledgeArtifact,
    roles: Vec<String>,
    is_root: bool,
}

impl<'a, R: ArtifactRepository + ?Sized> PackageAssembler<'a, R> {
    pub fn new(repository: &'a R, cache: &'a ExpansionCache) -> Self {
        Self {
            repository,
            cache,
            terminology: None,
        }
    }

    pub fn with_terminology(mut self, terminology: &'a dyn TerminologyProvider) -> Self {
        self.terminology = Some(terminology);
        self
    }

    pub fn package(
        &self,
        root: &CanonicalReference,
        params: &PackageParams,
    ) -> Result<Bundle, ArtifactError> {
        params.validate()?;
        let options = WalkOptions {
            follow_unowned: true,
            overrides: params.overrides.clone(),
        };
        let graph = DependencyGraphWalker::new(self.repository, options).collect(root)?;
        let root_artifact = graph.root_artifact()?;
        check_capabilities(root_artifact, &params.capability)?;

        let mut bundle = Bundle::new(params.bundle_type.unwrap_or_default());
        for node in graph.unresolved() {
            if node.reference.is_contained() {
                tracing::debug!(reference = %node.reference, "contained reference not packaged");
                continue;
            }
            bundle.issue.push(Issue::error(format!(
                "Resource '{}' could not be found and was not packaged",
                node.reference
            )));
        }

        let mut candidates = collect_candidates(&graph);
        apply_usage_contexts(root_artifact, &mut candidates);
        candidates.retain(|candidate| {
            candidate.is_root || matches_include(&params.include, candidate)
        });

        let total = candidates.len();
        let offset = params.offset.unwrap_or(0).max(0) as usize;
        let count = params
            .count
            .map(|count| count.max(0) as usize)
            .unwrap_or(usize::MAX);
        let page: Vec<Candidate> = candidates.into_iter().skip(offset).take(count).collect();

        let local: HashMap<CanonicalReference, KnowledgeArtifact> = graph
            .nodes()
            .iter()
            .filter_map(|node| node.artifact.as_ref())
            .map(|artifact| (artifact.canonical(), artifact.clone()))
            .collect();

        for candidate in page {
            let mut artifact = candidate.artifact;
            if artifact.is_value_set() {
                self.attach_expansion(&mut artifact, params, &local, &mut bundle)?;
            }
            let reference = artifact.canonical();
            artifact.id = Some(ids::canonical_id(reference.tail(), reference.version()));
            bundle.entry.push(entry_for(bundle.kind, artifact));
        }

        if bundle.kind == BundleType::Searchset {
            bundle.total = Some(total);
        }

        let stats = self.cache.stats();
        tracing::info!(
            root = %root,
            total,
            entries = bundle.entry.len(),
            issues = bundle.issue.len(),
            cache_entries = stats.entries,
            cache_hits = stats.hits,
            "packaged artifact"
        );
        Ok(bundle)
    }

    fn attach_expansion(
        &self,
        value_set: &mut KnowledgeArtifact,
        params: &PackageParams,
        local: &HashMap<CanonicalReference, KnowledgeArtifact>,
        bundle: &mut Bundle,
    ) -> Result<(), ArtifactError> {
        let mut expander = ValueSetExpander::new(self.repository, self.cache)
            .with_parameters(params.expansion_parameters.clone());
        if let Some(endpoint) = params.terminology_endpoint.as_ref() {
            require_credentials(endpoint, &value_set.url)?;
            if let Some(terminology) = self.terminology {
                expander = expander.with_provider(terminology, Some(endpoint));
            }
        }

        match expander.expand(value_set, local) {
            Ok(expansion) => {
                for warning in expansion.warnings() {
                    bundle.issue.push(Issue::warning(format!(
                        "ValueSet '{}': {warning}",
                        value_set.url
                    )));
                }
                value_set.expansion = Some(expansion);
                Ok(())
            }
            Err(
                err @ ArtifactError::Unprocessable {
                    status: Some(401 | 403),
                    ..
                },
            ) => Err(err),
            Err(err) => {
                tracing::warn!(value_set = %value_set.url, error = %err, "expansion failed");
                bundle.issue.push(Issue::warning(err.to_string()));
                Ok(())
            }
        }
    }
}

fn check_capabilities(root: &KnowledgeArtifact, required: &[String]) -> Result<(), ArtifactError> {
    if required.is_empty() {
        return Ok(());
    }
    let declared: Vec<&str> = root
        .extension
        .iter()
        .filter(|ext| ext.url == KNOWLEDGE_CAPABILITY_URL)
        .filter_map(|ext| ext.value_str())
        .collect();
    if declared.is_empty() {
        return Err(ArtifactError::Precondition(format!(
            "Resource with url: '{}' does not specify capability.",
            root.url
        )));
    }
    if required
        .iter()
        .any(|capability| !declared.contains(&capability.as_str()))
    {
        return Err(ArtifactError::Precondition(format!(
            "Resource with url: '{}' is not one of '{}'.",
            root.url,
            required.join(", ")
        )));
    }
    Ok(())
}

/// Root first, then every resolved node once per `url|version`.
fn collect_candidates(graph: &DependencyGraph) -> Vec<Candidate> {
    let mut roles: HashMap<usize, Vec<String>> = HashMap::new();
    for edge in graph.edges_from(DependencyGraph::ROOT) {
        roles
            .entry(edge.target)
            .or_default()
            .extend(dependency_roles(&edge.extensions));
    }

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for (id, node) in graph.nodes().iter().enumerate() {
        let Some(artifact) = &node.artifact else {
            continue;
        };
        if !seen.insert(artifact.canonical().key()) {
            continue;
        }
        let mut node_roles = roles
            .remove(&id)
            .unwrap_or_else(|| vec!["default".to_string()]);
        node_roles.sort();
        node_roles.dedup();
        candidates.push(Candidate {
            artifact: artifact.clone(),
            roles: node_roles,
            is_root: id == DependencyGraph::ROOT,
        });
    }
    candidates
}

/// Copies intended usage contexts declared on the root's related artifacts onto their targets.
fn apply_usage_contexts(root: &KnowledgeArtifact, candidates: &mut [Candidate]) {
    for related in &root.related_artifact {
        let Some(reference) = related.reference() else {
            continue;
        };
        let proposed: Vec<_> = related
            .extension
            .iter()
            .filter(|ext| ext.url == INTENDED_USAGE_CONTEXT_URL)
            .filter_map(|ext| ext.value_usage_context())
            .collect();
        if proposed.is_empty() {
            continue;
        }
        for candidate in candidates.iter_mut().filter(|c| !c.is_root) {
            let canonical = candidate.artifact.canonical();
            let matches = canonical.same_url(&reference)
                && (reference.version().is_none() || reference.version() == canonical.version());
            if !matches || !candidate.artifact.is_leaf_value_set() {
                continue;
            }
            for usage in &proposed {
                if !candidate.artifact.use_context.contains(usage) {
                    candidate.artifact.use_context.push(usage.clone());
                }
            }
        }
    }
}

fn matches_include(include: &[String], candidate: &Candidate) -> bool {
    if include.is_empty() {
        return true;
    }
    include
        .iter()
        .any(|filter| matches_filter(filter, candidate))
}

fn matches_filter(filter: &str, candidate: &Candidate) -> bool {
    let artifact = &candidate.artifact;
    let resource_type = artifact.resource_type.as_str();
    let kind = artifact.kind_code();
    match filter {
        "artifact" => candidate.is_root,
        "canonical" => !artifact.url.is_empty(),
        "knowledge" => KNOWLEDGE_TYPES.contains(&resource_type),
        "terminology" => TERMINOLOGY_TYPES.contains(&resource_type),
        "conformance" => CONFORMANCE_TYPES.contains(&resource_type),
        "extensions" => {
            resource_type == "StructureDefinition" && kind.as_deref() == Some("Extension")
        }
        "profiles" => {
            resource_type == "StructureDefinition" && kind.as_deref() != Some("Extension")
        }
        "tests" => {
            (resource_type == "Library" && kind.as_deref() == Some("test-case"))
                || artifact.has_true_extension_containing("isTestCase")
        }
        "examples" => artifact.has_true_extension_containing("isExample"),
        role if ROLE_FILTERS.contains(&role) => candidate.roles.iter().any(|r| r == role),
        other => resource_type == other,
    }
}

fn entry_for(kind: BundleType, artifact: KnowledgeArtifact) -> BundleEntry {
    let canonical = artifact.canonical();
    let request = match kind {
        BundleType::Transaction => Some(EntryRequest {
            method: HttpVerb::Post,
            url: artifact.resource_type.clone(),
            if_none_exist: Some(format!(
                "url={}&version={}",
                canonical.url(),
                canonical.version().unwrap_or_default()
            )),
        }),
        _ => None,
    };
    BundleEntry {
        full_url: Some(canonical.to_string()),
        resource: Some(Resource::Artifact(artifact)),
        request,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        ArtifactStatus, Coding, CodeableConcept, Compose, Concept, ConceptSet, DEPENDENCY_ROLE_URL,
        Extension, RelatedArtifact, RelationType, UsageContext,
    };
    use crate::repository::InMemoryRepository;
    use serde_json::json;

    fn artifact(kind: &str, name: &str) -> KnowledgeArtifact {
        let mut artifact =
            KnowledgeArtifact::new(kind, &format!("http://ex.org/{kind}/{name}"), Some("1.0.0"));
        artifact.status = ArtifactStatus::Active;
        artifact
    }

    fn leaf(name: &str) -> KnowledgeArtifact {
        let mut vs = artifact("ValueSet", name);
        vs.compose = Some(Compose {
            include: vec![ConceptSet {
                system: Some("http://loinc.org".into()),
                concept: vec![Concept {
                    code: format!("{name}-1"),
                    display: None,
                }],
                ..Default::default()
            }],
        });
        vs
    }

    fn depends(target: &str) -> RelatedArtifact {
        RelatedArtifact::new(RelationType::DependsOn, target)
    }

    /// Root library with eight dependencies across knowledge and terminology types.
    fn repository() -> InMemoryRepository {
        let mut root = artifact("Library", "root");
        root.extension
            .push(Extension::string(KNOWLEDGE_CAPABILITY_URL, "computable"));
        let mut keyed = depends("http://ex.org/ValueSet/vs1|1.0.0");
        keyed
            .extension
            .push(Extension::code(DEPENDENCY_ROLE_URL, "key"));
        keyed.extension.push(Extension::with_value(
            INTENDED_USAGE_CONTEXT_URL,
            "UsageContext",
            json!({
                "code": {"system": "http://terminology.hl7.org/CodeSystem/usage-context-type", "code": "focus"},
                "valueCodeableConcept": {"coding": [{"system": "http://snomed.info/sct", "code": "840539006"}]}
            }),
        ));
        root.related_artifact = vec![
            keyed,
            depends("http://ex.org/ValueSet/vs2"),
            depends("http://ex.org/ValueSet/vs3"),
            depends("http://ex.org/Library/helpers"),
            depends("http://ex.org/PlanDefinition/pd"),
            depends("http://ex.org/Measure/m"),
            depends("http://ex.org/CodeSystem/cs"),
            depends("http://ex.org/StructureDefinition/ext"),
        ];
        let mut ext = artifact("StructureDefinition", "ext");
        ext.kind = Some(json!("Extension"));
        InMemoryRepository::with_artifacts([
            root,
            leaf("vs1"),
            leaf("vs2"),
            leaf("vs3"),
            artifact("Library", "helpers"),
            artifact("PlanDefinition", "pd"),
            artifact("Measure", "m"),
            artifact("CodeSystem", "cs"),
            ext,
        ])
        .unwrap()
    }

    fn root() -> CanonicalReference {
        CanonicalReference::parse("http://ex.org/Library/root|1.0.0").unwrap()
    }

    fn package(params: PackageParams) -> Result<Bundle, ArtifactError> {
        let repository = repository();
        let cache = ExpansionCache::new();
        PackageAssembler::new(&repository, &cache).package(&root(), &params)
    }

    #[test]
    fn count_zero_reports_total_only() {
        let bundle = package(PackageParams {
            count: Some(0),
            ..Default::default()
        })
        .unwrap();
        assert!(bundle.entry.is_empty());
        assert_eq!(bundle.total, Some(9));
    }

    #[test]
    fn offsets_page_through_entries() {
        let at_end = package(PackageParams {
            offset: Some(9),
            ..Default::default()
        })
        .unwrap();
        assert!(at_end.entry.is_empty());
        assert_eq!(at_end.total, Some(9));

        let last_four = package(PackageParams {
            offset: Some(5),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(last_four.entry.len(), 4);
    }

    #[test]
    fn root_is_first_and_artifact_filter_keeps_only_root() {
        let bundle = package(PackageParams {
            include: vec!["artifact".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(bundle.entry.len(), 1);
        assert_eq!(
            bundle.entry[0].full_url.as_deref(),
            Some("http://ex.org/Library/root|1.0.0")
        );
    }

    #[test]
    fn include_filters_select_by_category_and_role() {
        let terminology = package(PackageParams {
            include: vec!["terminology".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(terminology.entry.len(), 5);

        let extensions = package(PackageParams {
            include: vec!["extensions".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(extensions.entry.len(), 2);

        let key = package(PackageParams {
            include: vec!["key".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(key.entry.len(), 2);

        let measures = package(PackageParams {
            include: vec!["Measure".into()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(measures.entry.len(), 2);
    }

    #[test]
    fn transaction_entries_are_conditional_creates() {
        let bundle = package(PackageParams {
            bundle_type: Some(BundleType::Transaction),
            ..Default::default()
        })
        .unwrap();
        assert!(bundle.total.is_none());
        let request = bundle.entry[0].request.as_ref().unwrap();
        assert_eq!(request.method, HttpVerb::Post);
        assert_eq!(
            request.if_none_exist.as_deref(),
            Some("url=http://ex.org/Library/root&version=1.0.0")
        );

        let collection = package(PackageParams {
            bundle_type: Some(BundleType::Collection),
            ..Default::default()
        })
        .unwrap();
        assert!(collection.total.is_none());
        assert!(collection.entry.iter().all(|entry| entry.request.is_none()));
    }

    #[test]
    fn invalid_paging_is_validation_error() {
        let negative = package(PackageParams {
            count: Some(-1),
            ..Default::default()
        });
        assert!(matches!(negative, Err(ArtifactError::Validation(_))));

        let paged_transaction = package(PackageParams {
            offset: Some(1),
            bundle_type: Some(BundleType::Transaction),
            ..Default::default()
        });
        assert!(matches!(paged_transaction, Err(ArtifactError::Validation(_))));
    }

    #[test]
    fn capability_must_be_declared() {
        assert!(
            package(PackageParams {
                capability: vec!["computable".into()],
                ..Default::default()
            })
            .is_ok()
        );
        let err = package(PackageParams {
            capability: vec!["executable".into()],
            ..Default::default()
        })
        .expect_err("capability missing");
        assert_eq!(
            err.to_string(),
            "precondition failed: Resource with url: 'http://ex.org/Library/root' is not one of 'executable'."
        );
    }

    #[test]
    fn value_sets_get_naive_expansions_and_usage_contexts() {
        let bundle = package(PackageParams::default()).unwrap();
        let vs1 = bundle
            .artifacts()
            .find(|artifact| artifact.url == "http://ex.org/ValueSet/vs1")
            .unwrap();
        let expansion = vs1.expansion.as_ref().unwrap();
        assert!(expansion.is_naive());
        assert_eq!(expansion.contains.len(), 1);
        assert_eq!(vs1.use_context.len(), 1);
        assert_eq!(vs1.id.as_deref(), Some("vs1-1.0.0"));

        let expected = UsageContext {
            code: Coding::new(
                "http://terminology.hl7.org/CodeSystem/usage-context-type",
                "focus",
            ),
            value_codeable_concept: Some(CodeableConcept {
                coding: vec![Coding::new("http://snomed.info/sct", "840539006")],
                text: None,
            }),
            value_reference: None,
        };
        assert_eq!(vs1.use_context[0], expected);
    }

    #[test]
    fn check_version_mismatch_is_precondition_and_missing_version_is_issue() {
        let err = package(PackageParams {
            overrides: VersionOverrides {
                check_artifact_version: vec![
                    CanonicalReference::parse("http://ex.org/ValueSet/vs1|2.0.0").unwrap(),
                ],
                ..Default::default()
            },
            ..Default::default()
        })
        .expect_err("check mismatch");
        assert!(matches!(err, ArtifactError::Precondition(_)));

        let bundle = package(PackageParams {
            overrides: VersionOverrides {
                force_artifact_version: vec![
                    CanonicalReference::parse("http://ex.org/Measure/m|9.9.9").unwrap(),
                ],
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        assert_eq!(bundle.issue.len(), 1);
        assert_eq!(bundle.total, Some(8));
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let err = package(PackageParams {
            terminology_endpoint: Some(TerminologyEndpoint {
                address: "https://tx.example.org/fhir".into(),
                username: Some("alice".into()),
                api_key: None,
            }),
            ..Default::default()
        })
        .expect_err("api key required");
        assert!(err.to_string().contains("VSAC API Key"));
    }
}
