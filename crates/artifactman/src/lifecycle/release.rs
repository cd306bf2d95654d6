use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::artifact::CanonicalArtifact;
use crate::bundle::{Bundle, Resource};
use crate::canonical::CanonicalReference;
use crate::dependency_graph::{DependencyGraph, NodeId};
use crate::error::ArtifactError;
use crate::model::{
    ArtifactStatus, Extension, FhirDateTime, KnowledgeArtifact, RELEASE_LABEL_URL, RelatedArtifact,
    RelationType,
};
use crate::params::{ParameterMap, TerminologyEndpoint};
use crate::repository::ArtifactRepository;
use crate::version::{self, VersionBehavior};

use super::{LifecycleEngine, LifecycleOutcome, precondition_status, rewrite_references};

/// Handling of experimental artifacts referenced by a non-experimental release.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExperimentalPolicy {
    #[default]
    None,
    Warn,
    Error,
}

impl FromStr for ExperimentalPolicy {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ExperimentalPolicy::None),
            "warn" => Ok(ExperimentalPolicy::Warn),
            "error" => Ok(ExperimentalPolicy::Error),
            other => Err(ArtifactError::Validation(format!(
                "Invalid requireNonExperimental '{other}'. Valid values are 'none', 'warn', 'error'."
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ReleaseParams {
    pub version: Option<String>,
    pub version_behavior: Option<VersionBehavior>,
    pub require_non_experimental: ExperimentalPolicy,
    pub release_label: Option<String>,
    pub latest_from_tx_server: bool,
    pub terminology_endpoint: Option<TerminologyEndpoint>,
}

impl ReleaseParams {
    pub fn from_parameters(params: &ParameterMap) -> Result<Self, ArtifactError> {
        Ok(Self {
            version: params.string("version").map(str::to_string),
            version_behavior: params.code("versionBehavior")?,
            require_non_experimental: params
                .code("requireNonExperimental")?
                .unwrap_or_default(),
            release_label: params.string("releaseLabel").map(str::to_string),
            latest_from_tx_server: params.boolean("latestFromTxServer")?.unwrap_or(false),
            terminology_endpoint: params.endpoint().cloned(),
        })
    }
}

pub(super) fn release<R: ArtifactRepository>(
    engine: &LifecycleEngine<R>,
    root_ref: &CanonicalReference,
    params: &ReleaseParams,
) -> Result<LifecycleOutcome, ArtifactError> {
    let behavior = params.version_behavior.ok_or_else(|| {
        ArtifactError::unprocessable(
            "'versionBehavior' must be provided as an argument to the $release operation. Valid values are 'default', 'check', 'force'.",
        )
    })?;
    let endpoint = match (params.latest_from_tx_server, params.terminology_endpoint.as_ref()) {
        (true, None) => {
            return Err(ArtifactError::unprocessable(
                "latestFromTxServer requires a terminologyEndpoint to be provided",
            ));
        }
        (true, Some(endpoint)) => Some(endpoint),
        (false, _) => None,
    };

    let graph = engine.owned_graph(root_ref)?;
    let mut root = graph.root_artifact()?.clone();

    let release_version = version::resolve(
        root.version(),
        params.version.as_deref(),
        behavior,
        root.status(),
    )?;
    if root.status() != ArtifactStatus::Draft {
        return Err(precondition_status(&root, "release", "'draft'"));
    }
    check_approval(&root)?;

    let mut warnings = Vec::new();
    if !root.is_experimental() && params.require_non_experimental != ExperimentalPolicy::None {
        for url in experimental_references(engine.repository(), &graph)? {
            let message = format!(
                "Root artifact is not Experimental, but references an Experimental resource with URL '{url}'."
            );
            if params.require_non_experimental == ExperimentalPolicy::Error {
                return Err(ArtifactError::unprocessable(message));
            }
            tracing::warn!(root = %root_ref, experimental = %url, "experimental dependency");
            warnings.push(message);
        }
    }

    let now = FhirDateTime::now();
    let components = releasable_components(&graph);
    let released_urls: HashSet<String> = components
        .iter()
        .map(|id| graph.node(*id).canonical().url_key().to_string())
        .collect();

    let mut released = Vec::with_capacity(components.len());
    for id in &components {
        let Some(mut component) = graph.node(*id).artifact.clone() else {
            continue;
        };
        component.set_version(Some(release_version.clone()));
        component.set_status(ArtifactStatus::Active);
        component.set_date(Some(now));
        propagate_effective_period(&root, &mut component);
        rewrite_references(&mut component, &released_urls, &release_version);
        released.push(component);
    }

    root.set_version(Some(release_version.clone()));
    root.set_status(ArtifactStatus::Active);
    root.set_date(Some(now));
    if let Some(label) = params.release_label.as_deref() {
        root.set_extension(Extension::string(RELEASE_LABEL_URL, label));
    }
    rewrite_references(&mut root, &released_urls, &release_version);

    let mut pinned = Vec::new();
    let classification = graph.classify();
    for id in classification
        .components
        .iter()
        .chain(classification.dependencies.iter())
    {
        let reference = pinned_reference(
            engine,
            &graph,
            *id,
            &released_urls,
            &release_version,
            endpoint,
        )?;
        pinned.push(reference);
    }
    rebuild_depends_on(&mut root, pinned);

    let mut mutations = Bundle::transaction();
    mutations.push_put(Resource::Artifact(root.clone()));
    for component in released {
        mutations.push_put(Resource::Artifact(component));
    }

    tracing::info!(
        canonical = %root.canonical(),
        components = components.len(),
        warnings = warnings.len(),
        "planned release"
    );
    Ok(LifecycleOutcome {
        root,
        mutations,
        warnings,
    })
}

fn check_approval(root: &KnowledgeArtifact) -> Result<(), ArtifactError> {
    let approval = root.approval_date().ok_or_else(|| {
        ArtifactError::unprocessable(
            "The artifact must be approved (indicated by approvalDate) before it is eligible for release.",
        )
    })?;
    if let Some(date) = root.date() {
        if approval < date {
            return Err(ArtifactError::unprocessable(format!(
                "The artifact was approved on '{approval}', but was last modified on '{date}'. An approval must be provided after the most-recent update."
            )));
        }
    }
    Ok(())
}

/// Owned descendants still in draft; the rest are left untouched.
fn releasable_components(graph: &DependencyGraph) -> Vec<NodeId> {
    graph
        .owned_descendants()
        .into_iter()
        .filter(|id| {
            let node = graph.node(*id);
            match &node.artifact {
                Some(artifact) if artifact.status == ArtifactStatus::Draft => true,
                Some(artifact) => {
                    tracing::debug!(
                        component = %node.reference,
                        status = %artifact.status,
                        "owned component is not a draft, leaving as is"
                    );
                    false
                }
                None => {
                    tracing::warn!(component = %node.reference, "owned component could not be resolved");
                    false
                }
            }
        })
        .collect()
}

fn propagate_effective_period(root: &KnowledgeArtifact, child: &mut KnowledgeArtifact) {
    let Some(period) = root.effective_period().filter(|period| !period.is_empty()) else {
        return;
    };
    if child.effective_period().is_none_or(|existing| existing.is_empty()) {
        child.set_effective_period(Some(period.clone()));
    }
}

fn pinned_reference<R: ArtifactRepository>(
    engine: &LifecycleEngine<R>,
    graph: &DependencyGraph,
    id: NodeId,
    released_urls: &HashSet<String>,
    release_version: &str,
    endpoint: Option<&TerminologyEndpoint>,
) -> Result<CanonicalReference, ArtifactError> {
    let node = graph.node(id);
    let canonical = node.canonical();
    if released_urls.contains(canonical.url_key()) {
        return Ok(canonical.with_version(Some(release_version)));
    }

    if let Some(endpoint) = endpoint {
        let is_value_set = node
            .artifact
            .as_ref()
            .map(KnowledgeArtifact::is_value_set)
            .unwrap_or_else(|| node.reference.resource_type() == Some("ValueSet"));
        if is_value_set && node.reference.version().is_none() {
            if let Some(latest) = engine.terminology.latest_version(canonical.url(), endpoint)? {
                tracing::debug!(reference = %canonical, latest = %latest, "pinned to terminology server version");
                return Ok(canonical.with_version(Some(&latest)));
            }
        }
    }
    Ok(canonical)
}

/// Replaces every `depends-on` entry with one per pinned reference, keeping extensions of matching urls.
fn rebuild_depends_on(root: &mut KnowledgeArtifact, pinned: Vec<CanonicalReference>) {
    let mut extensions: HashMap<String, Vec<Extension>> = HashMap::new();
    for related in root.related_artifacts() {
        if related.relation != RelationType::DependsOn {
            continue;
        }
        if let Some(reference) = related.reference() {
            extensions
                .entry(reference.url_key().to_string())
                .or_default()
                .extend(related.extension.iter().cloned());
        }
    }

    let own_url = root.canonical().url_key().to_string();
    let related = root.related_artifacts_mut();
    related.retain(|entry| entry.relation != RelationType::DependsOn);

    let mut seen = HashSet::new();
    for reference in pinned {
        if reference.url_key() == own_url || !seen.insert(reference.key()) {
            continue;
        }
        let mut entry = RelatedArtifact::new(RelationType::DependsOn, reference.to_string());
        if let Some(carried) = extensions.get(reference.url_key()) {
            for extension in carried {
                if !entry.extension.contains(extension) {
                    entry.extension.push(extension.clone());
                }
            }
        }
        related.push(entry);
    }
}

/// Urls of experimental artifacts reachable from the graph, following value-set includes.
fn experimental_references<R: ArtifactRepository>(
    repository: &R,
    graph: &DependencyGraph,
) -> Result<Vec<String>, ArtifactError> {
    let mut offending = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<KnowledgeArtifact> = graph
        .nodes()
        .iter()
        .skip(1)
        .filter_map(|node| node.artifact.clone())
        .collect();
    stack.reverse();

    while let Some(artifact) = stack.pop() {
        if !visited.insert(artifact.canonical().key()) {
            continue;
        }
        if artifact.experimental && !offending.contains(&artifact.url) {
            offending.push(artifact.url.clone());
        }
        for include in artifact.value_set_includes() {
            let Ok(reference) = CanonicalReference::parse(&include) else {
                continue;
            };
            if let Some(child) = repository.read(&reference)? {
                stack.push(child);
            }
        }
    }
    Ok(offending)
}
