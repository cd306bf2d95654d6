use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;
use crate::model::ArtifactStatus;

pub const DRAFT_SUFFIX: &str = "-draft";

/// Policy applied when choosing the version an operation assigns.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VersionBehavior {
    Default,
    Force,
    Check,
}

impl FromStr for VersionBehavior {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(VersionBehavior::Default),
            "force" => Ok(VersionBehavior::Force),
            "check" => Ok(VersionBehavior::Check),
            other => Err(ArtifactError::Validation(format!(
                "Invalid versionBehavior '{other}'. Valid values are 'default', 'check', 'force'."
            ))),
        }
    }
}

impl fmt::Display for VersionBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VersionBehavior::Default => "default",
            VersionBehavior::Force => "force",
            VersionBehavior::Check => "check",
        };
        f.write_str(label)
    }
}

fn numeric_version() -> &'static Regex {
    static NUMERIC: OnceLock<Regex> = OnceLock::new();
    NUMERIC.get_or_init(|| {
        Regex::new(r"^(\d+(\.\d+)*|\d{8}|\d{4}-\d{2}-\d{2})$").expect("Invalid regex")
    })
}

/// Checks a version identifier against the relaxed numeric grammar.
pub fn validate(version: &str) -> Result<(), ArtifactError> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return Err(ArtifactError::Validation(
            "The version argument is required".into(),
        ));
    }
    if trimmed.to_ascii_lowercase().contains("draft") {
        return Err(ArtifactError::Validation(
            "The version cannot contain 'draft'".into(),
        ));
    }
    if trimmed.contains(['/', '\\', '|']) {
        return Err(ArtifactError::Validation(
            "The version contains illegal characters".into(),
        ));
    }
    if !numeric_version().is_match(trimmed) {
        return Err(ArtifactError::Validation(
            "The version must be in a dot-delimited numeric format".into(),
        ));
    }
    Ok(())
}

/// Picks the version an operation assigns to the root and its owned components.
///
/// `requested` may be a bare version or `url|version`.
pub fn resolve(
    current: Option<&str>,
    requested: Option<&str>,
    behavior: VersionBehavior,
    status: ArtifactStatus,
) -> Result<String, ArtifactError> {
    let requested = requested
        .map(requested_version)
        .filter(|v| !v.trim().is_empty());

    match behavior {
        VersionBehavior::Default => {
            if let Some(current) = current.filter(|v| !v.trim().is_empty()) {
                return Ok(strip_draft_suffix(current).to_string());
            }
            let requested = requested.ok_or_else(|| {
                ArtifactError::Validation("The version argument is required".into())
            })?;
            validate(requested)?;
            Ok(requested.to_string())
        }
        VersionBehavior::Force => {
            if status == ArtifactStatus::Active {
                return Err(ArtifactError::Precondition(
                    "Cannot force a version onto an active artifact".into(),
                ));
            }
            let requested = requested.ok_or_else(|| {
                ArtifactError::Validation("The version argument is required".into())
            })?;
            validate(requested)?;
            Ok(requested.to_string())
        }
        VersionBehavior::Check => {
            let requested = requested.ok_or_else(|| {
                ArtifactError::Validation("The version argument is required".into())
            })?;
            validate(requested)?;
            let existing = current.map(strip_draft_suffix).unwrap_or_default();
            if existing != requested {
                return Err(ArtifactError::Precondition(format!(
                    "versionBehavior 'check' expected version '{requested}' but the artifact has version '{existing}'"
                )));
            }
            Ok(requested.to_string())
        }
    }
}

fn requested_version(raw: &str) -> &str {
    match raw.split_once('|') {
        Some((_, version)) => version.trim(),
        None => raw.trim(),
    }
}

/// Appends the draft suffix unless it is already present.
pub fn to_draft_suffix(version: &str) -> String {
    if version.ends_with(DRAFT_SUFFIX) {
        version.to_string()
    } else {
        format!("{version}{DRAFT_SUFFIX}")
    }
}

pub fn strip_draft_suffix(version: &str) -> &str {
    version.strip_suffix(DRAFT_SUFFIX).unwrap_or(version)
}

pub fn is_draft_version(version: &str) -> bool {
    version.ends_with(DRAFT_SUFFIX)
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Component<'a> {
    Number(u64),
    Text(&'a str),
}

fn components(version: &str) -> Vec<Component<'_>> {
    version
        .split(['.', '-'])
        .map(|part| match part.parse::<u64>() {
            Ok(number) => Component::Number(number),
            Err(_) => Component::Text(part),
        })
        .collect()
}

/// Component-wise ordering; missing trailing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = components(a);
    let right = components(b);
    let len = left.len().max(right.len());
    for idx in 0..len {
        let l = left.get(idx).unwrap_or(&Component::Number(0));
        let r = right.get(idx).unwrap_or(&Component::Number(0));
        match l.cmp(r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Highest candidate by [`compare_versions`].
pub fn pin_latest<'a, I>(candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates
        .into_iter()
        .max_by(|a, b| compare_versions(a, b))
        .map(str::to_string)
}
