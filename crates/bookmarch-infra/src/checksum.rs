//! SHA-256 checksumming for artifact payloads.
//!
//! The artifact store stamps each payload with a lowercase hex SHA-256
//! digest of its canonical JSON at write time, so readers can verify an
//! artifact was not partially written. Uses the `sha2` crate (RustCrypto
//! ecosystem).

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 digest of `content`.
pub fn sha256_hex(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{:x}", digest)
}
