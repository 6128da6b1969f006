use rand::RngCore;
use sha2::{Digest, Sha256};
use std::{fmt, sync::Arc};

/// The header carrying the internal secret on sidecar requests.
pub const HEADER: &str = "X-Internal-Auth";

/// A process-lifetime shared secret presented to the sidecar's admin endpoints.
#[derive(Clone)]
pub struct InternalSecret(Arc<str>);

// === impl InternalSecret ===

impl InternalSecret {
    /// The hex SHA-256 digest of 32 random bytes.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self(format!("{:x}", Sha256::digest(seed)).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InternalSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InternalSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_hex_digests() {
        let a = InternalSecret::generate();
        let b = InternalSecret::generate();
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.as_str(), b.as_str());
        assert_eq!(format!("{a:?}"), "InternalSecret(..)");
    }
}
