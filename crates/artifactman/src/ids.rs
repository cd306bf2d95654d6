use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::ArtifactError;

pub const MAX_ID_LENGTH: usize = 64;

/// Random 32-character hex identifier.
pub fn random_id() -> Result<String, ArtifactError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes)
        .map_err(|err| ArtifactError::Io(std::io::Error::other(err.to_string())))?;
    Ok(hex::encode(bytes))
}

/// Resource ids allow ASCII letters, digits, `-` and `.`, up to 64 characters.
pub fn is_valid_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= MAX_ID_LENGTH
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Deterministic id for a canonical: `<tail>-<version>` when usable, else a hash-based id.
pub fn canonical_id(tail: &str, version: Option<&str>) -> String {
    let candidate = match version {
        Some(version) => format!("{tail}-{version}"),
        None => tail.to_string(),
    };
    let normalized: String = candidate.nfkd().filter(char::is_ascii).collect();
    if is_valid_id(&normalized) {
        return normalized;
    }

    let mut hasher = Sha256::new();
    hasher.update(candidate.as_bytes());
    let digest = hex::encode(hasher.finalize());
    let mut id = format!("cv-{digest}");
    id.truncate(MAX_ID_LENGTH);
    id
}
