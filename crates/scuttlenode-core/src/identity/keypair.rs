//! Ed25519 key pair of the local identity

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};

use super::IdentityRef;
use crate::error::NodeError;

/// An ed25519 key pair. The public half names the identity's feed.
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        // Use getrandom directly to avoid rand version conflicts
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed).expect("Failed to get random bytes");
        Self::from_seed(&seed)
    }

    /// Deterministic identity from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Restore from the bytes produced by [`Identity::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NodeError::Crypto(format!("identity seed must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_seed(&seed))
    }

    /// The 32-byte seed; this is the secret and must be stored with care.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public(&self) -> IdentityRef {
        IdentityRef::from_verifying_key(&self.signing.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    /// Secret scalar bytes usable for X25519 (the curve25519 twin of this key).
    pub(crate) fn curve25519_secret(&self) -> [u8; 32] {
        self.signing.to_scalar_bytes()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("public", &self.public()).finish()
    }
}

/// Verify an ed25519 signature made by `signer`.
pub fn verify_signature(signer: &IdentityRef, message: &[u8], signature: &Signature) -> bool {
    match signer.verifying_key() {
        Ok(key) => key.verify(message, signature).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate();
        let sig = identity.sign(b"hello");
        assert!(verify_signature(&identity.public(), b"hello", &sig));
        assert!(!verify_signature(&identity.public(), b"hellO", &sig));
    }

    #[test]
    fn test_seed_roundtrip() {
        let identity = Identity::generate();
        let restored = Identity::from_bytes(&identity.to_bytes()).unwrap();
        assert_eq!(identity.public(), restored.public());
    }

    #[test]
    fn test_from_bytes_rejects_short_input() {
        assert!(Identity::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_other_identity_does_not_verify() {
        let alice = Identity::generate();
        let bob = Identity::generate();
        let sig = alice.sign(b"from alice");
        assert!(!verify_signature(&bob.public(), b"from alice", &sig));
    }
}
