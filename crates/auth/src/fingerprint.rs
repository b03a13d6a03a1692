use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// SHA-256 hex digest of a token.
pub fn fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// The configured master key, kept only as a digest.
pub struct MasterKey {
    digest: [u8; 32],
}

impl MasterKey {
    /// Hash the configured key.
    pub fn new(key: &SecretString) -> Self {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(key.expose_secret().as_bytes()));

        Self { digest }
    }

    /// Compare digests in constant time.
    pub fn matches(&self, token: &str) -> bool {
        let digest = Sha256::digest(token.as_bytes());
        self.digest[..].ct_eq(&digest[..]).into()
    }
}
