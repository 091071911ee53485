//! Build identity and configuration fingerprint helpers.

use super::timestamps::{compact_stamp, now_utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a build id of the form `lfs-YYYYmmdd-HHMMSS-xxxxxxxx`.
#[must_use]
pub fn generate_build_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("lfs-{}-{}", compact_stamp(&now_utc()), &suffix[..8])
}

/// Returns the first 16 hex characters of the SHA-256 of `content`.
#[must_use]
pub fn config_fingerprint(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}
