use crate::artifact::CanonicalArtifact;
use crate::bundle::{Bundle, Resource};
use crate::canonical::CanonicalReference;
use crate::error::ArtifactError;
use crate::ids;
use crate::model::{Assessment, FhirDateTime};
use crate::params::ParameterMap;
use crate::repository::ArtifactRepository;

use super::{LifecycleEngine, LifecycleOutcome};

pub const ASSESSMENT_TYPES: [&str; 6] = [
    "comment",
    "classifier",
    "rating",
    "container",
    "response",
    "change-request",
];

#[derive(Clone, Debug, Default)]
pub struct ApproveParams {
    pub approval_date: Option<FhirDateTime>,
    pub assessment_type: Option<String>,
    pub summary: Option<String>,
    pub target: Option<CanonicalReference>,
    pub related_artifact: Option<String>,
    pub author: Option<String>,
}

impl ApproveParams {
    pub fn from_parameters(params: &ParameterMap) -> Result<Self, ArtifactError> {
        let owned = |name: &str| params.string(name).map(str::to_string);
        Ok(Self {
            approval_date: params.string("approvalDate").map(FhirDateTime::parse).transpose()?,
            assessment_type: owned("artifactAssessmentType"),
            summary: owned("artifactAssessmentSummary"),
            target: params
                .string("artifactAssessmentTarget")
                .map(CanonicalReference::parse)
                .transpose()?,
            related_artifact: owned("artifactAssessmentRelatedArtifact"),
            author: owned("artifactAssessmentAuthor"),
        })
    }
}

pub(super) fn approve<R: ArtifactRepository>(
    engine: &LifecycleEngine<R>,
    root_ref: &CanonicalReference,
    params: &ApproveParams,
) -> Result<LifecycleOutcome, ArtifactError> {
    let mut root = engine
        .repository()
        .read(root_ref)?
        .ok_or_else(|| ArtifactError::NotFound(format!("artifact '{root_ref}' was not found")))?;

    let information_type = params.assessment_type.as_deref().unwrap_or("comment");
    if !ASSESSMENT_TYPES.contains(&information_type) {
        return Err(ArtifactError::unprocessable(format!(
            "Invalid artifactAssessmentType '{information_type}'. Valid values are {}.",
            ASSESSMENT_TYPES.join(", ")
        )));
    }

    if let Some(target) = &params.target {
        if !target.same_url(&root.canonical()) {
            return Err(ArtifactError::unprocessable(
                "ArtifactCommentTarget URL does not match URL of resource being approved.",
            ));
        }
        if target.version().is_some() && target.version() != root.version() {
            return Err(ArtifactError::unprocessable(
                "ArtifactCommentTarget version does not match version of resource being approved.",
            ));
        }
    }

    let approval_date = params.approval_date.unwrap_or_else(FhirDateTime::now);
    root.set_approval_date(Some(approval_date));
    root.set_date(Some(approval_date));

    let codec = engine.schema_version.codec();
    let assessment = Assessment {
        resource_type: codec.assessment_type().to_string(),
        id: Some(ids::random_id()?),
        artifact_canonical: root.canonical().to_string(),
        information_type: information_type.to_string(),
        summary: params.summary.clone(),
        target: params.target.as_ref().map(ToString::to_string),
        related_artifact: params.related_artifact.clone(),
        author: params.author.clone(),
        date: approval_date,
    };

    let mut mutations = Bundle::transaction();
    mutations.push_put(Resource::Artifact(root.clone()));
    mutations.push_post(Resource::Assessment(assessment));

    tracing::info!(canonical = %root.canonical(), kind = information_type, "planned approval");
    Ok(LifecycleOutcome {
        root,
        mutations,
        warnings: Vec::new(),
    })
}
