use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ArtifactError;

/// `url` or `url|version` identifying a versioned knowledge artifact.
///
/// Equality, ordering, and hashing ignore a trailing slash on the url so that
/// `http://x/ValueSet/a/` and `http://x/ValueSet/a` address the same artifact.
#[derive(Clone, Debug)]
pub struct CanonicalReference {
    url: String,
    version: Option<String>,
}

impl CanonicalReference {
    pub fn new(url: impl Into<String>, version: Option<String>) -> Self {
        let version = version.filter(|v| !v.trim().is_empty());
        Self {
            url: url.into(),
            version,
        }
    }

    pub fn unversioned(url: impl Into<String>) -> Self {
        Self::new(url, None)
    }

    /// Splits `url|version`; a `#fragment` reference is kept verbatim as a contained reference.
    pub fn parse(raw: &str) -> Result<Self, ArtifactError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ArtifactError::Validation(
                "canonical reference must not be empty".into(),
            ));
        }
        match trimmed.split_once('|') {
            Some((url, version)) => {
                if url.is_empty() {
                    return Err(ArtifactError::Validation(format!(
                        "canonical reference '{trimmed}' has no url"
                    )));
                }
                Ok(Self::new(url, Some(version.to_string())))
            }
            None => Ok(Self::unversioned(trimmed)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn with_version(&self, version: Option<&str>) -> Self {
        Self::new(self.url.clone(), version.map(str::to_string))
    }

    pub fn without_version(&self) -> Self {
        Self::unversioned(self.url.clone())
    }

    pub fn is_contained(&self) -> bool {
        self.url.starts_with('#')
    }

    /// Lookup key: url without trailing slash, plus `|version` when present.
    pub fn key(&self) -> String {
        match &self.version {
            Some(version) => format!("{}|{}", self.url_key(), version),
            None => self.url_key().to_string(),
        }
    }

    /// Url without trailing slash.
    pub fn url_key(&self) -> &str {
        self.url.trim_end_matches('/')
    }

    /// Last path segment of the url (`.../ValueSet/2.16.840` -> `2.16.840`).
    pub fn tail(&self) -> &str {
        self.url_key().rsplit('/').next().unwrap_or(self.url_key())
    }

    /// Resource type segment preceding the tail, when the url follows `.../{Type}/{id}`.
    pub fn resource_type(&self) -> Option<&str> {
        let mut segments = self.url_key().rsplit('/');
        segments.next()?;
        let candidate = segments.next()?;
        candidate
            .chars()
            .next()
            .filter(char::is_ascii_uppercase)
            .map(|_| candidate)
    }

    pub fn same_url(&self, other: &CanonicalReference) -> bool {
        self.url_key() == other.url_key()
    }
}

impl fmt::Display for CanonicalReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}|{}", self.url, version),
            None => write!(f, "{}", self.url),
        }
    }
}

impl FromStr for CanonicalReference {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl PartialEq for CanonicalReference {
    fn eq(&self, other: &Self) -> bool {
        self.url_key() == other.url_key() && self.version == other.version
    }
}

impl Eq for CanonicalReference {}

impl Hash for CanonicalReference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url_key().hash(state);
        self.version.hash(state);
    }
}

impl PartialOrd for CanonicalReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.url_key()
            .cmp(other.url_key())
            .then_with(|| self.version.cmp(&other.version))
    }
}

impl Serialize for CanonicalReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl JsonSchema for CanonicalReference {
    fn schema_name() -> Cow<'static, str> {
        "CanonicalReference".into()
    }

    fn json_schema(generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        String::json_schema(generator)
    }
}

impl<'de> Deserialize<'de> for CanonicalReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
