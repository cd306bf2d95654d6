pub mod artifact;
pub mod bundle;
pub mod canonical;
pub mod changelog;
pub mod config;
pub mod dependency_graph;
pub mod diff;
pub mod error;
pub mod expansion;
pub mod expansion_cache;
pub mod ids;
pub mod lifecycle;
pub mod model;
pub mod package;
pub mod params;
pub mod persistence;
pub mod repository;
pub mod terminology;
pub mod version;
pub mod workspace;

pub use artifact::{ArtifactCodec, CanonicalArtifact, SchemaVersion};
pub use bundle::{Bundle, BundleEntry, BundleType, HttpVerb, Issue, IssueSeverity, Resource};
pub use canonical::CanonicalReference;
pub use changelog::{Attachment, ChangeLogFormat, ChangeLogRenderer};
pub use config::{TerminologyConfig, WorkspaceConfig, config_schema};
pub use dependency_graph::{
    Classification, DependencyGraph, DependencyGraphWalker, GraphEdge, GraphNode, NodeId,
    VersionOverrides, WalkOptions,
};
pub use diff::{ArtifactDiffEngine, ChangeLog, DiffOperation, DiffOperationType, DiffOptions, Page};
pub use error::ArtifactError;
pub use expansion::ValueSetExpander;
pub use expansion_cache::{CacheKey, CacheNotifier, CacheStats, ExpansionCache, ResourceChange};
pub use lifecycle::{
    ApproveParams, DraftParams, ExperimentalPolicy, LifecycleEngine, LifecycleOutcome, Operation,
    ReleaseParams, Transition,
};
pub use model::{ArtifactStatus, FhirDateTime, KnowledgeArtifact, RelatedArtifact, RelationType};
pub use package::{PackageAssembler, PackageParams};
pub use params::{ParameterMap, TerminologyEndpoint};
pub use persistence::FilesystemRepository;
pub use repository::{ArtifactRepository, InMemoryRepository};
pub use terminology::{HttpTerminologyProvider, TerminologyProvider, TerminologySettings};
pub use version::VersionBehavior;
pub use workspace::{
    FilesystemWorkspaceLocator, WorkspaceLocator, WorkspacePaths, discover as discover_workspace,
    init as init_workspace,
};
