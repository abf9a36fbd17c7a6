//! Join token fingerprints
//!
//! The bootstrap payload never carries a service account token itself, only
//! its fingerprint: URL-safe base64 (padded) of the SHA-256 digest of the raw
//! token bytes. The node agent recomputes the same fingerprint to verify the
//! credential it is handed later.

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE, Engine};

/// Data key under which service account token secrets carry the token
pub const TOKEN_KEY: &str = "token";

/// A service account token read from a credential secret
#[derive(Clone)]
pub struct JoinToken {
    raw: Vec<u8>,
}

impl JoinToken {
    /// Wrap raw token bytes
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self { raw: raw.into() }
    }

    /// Fingerprint embedded in the bootstrap payload
    pub fn hash(&self) -> String {
        token_hash(&self.raw)
    }
}

impl std::fmt::Debug for JoinToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinToken")
            .field("hash", &self.hash())
            .finish()
    }
}

/// URL-safe base64 of SHA-256 over `raw`
pub fn token_hash(raw: &[u8]) -> String {
    let hash = digest(&SHA256, raw);
    URL_SAFE.encode(hash.as_ref())
}
