//! Content hashes and deterministic fingerprints

use crate::error::{MeterflowError, Result};
use sha2::{Digest, Sha256};

/// Separator between fingerprint parts; cannot appear in object keys
const PART_SEPARATOR: u8 = 0x1f;

/// Hex encoded SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check `data` against an expected SHA-256 hex digest
pub fn verify_sha256(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(MeterflowError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Order-sensitive SHA-256 over a list of string parts
///
/// Parts are length-delimited by a separator byte so that `["ab", "c"]` and
/// `["a", "bc"]` never collide.
pub fn fingerprint<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([PART_SEPARATOR]);
    }
    hex::encode(hasher.finalize())
}
