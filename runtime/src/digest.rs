//! Content digests.

use cnab_push_core::error::{PushError, Result};
use sha2::{Digest, Sha256};

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Check `data` against `expected`. Only sha256 digests are verified; other
/// algorithms are accepted as-is.
pub fn verify(expected: &str, data: &[u8]) -> Result<()> {
    if !expected.starts_with("sha256:") {
        tracing::debug!(digest = %expected, "Skipping verification of non-sha256 digest");
        return Ok(());
    }
    let actual = sha256_digest(data);
    if actual == expected {
        Ok(())
    } else {
        Err(PushError::Bundle(format!(
            "Digest mismatch: expected {}, got {}",
            expected, actual
        )))
    }
}
