//! Peer names and the keys behind them.
//!
//! A router is addressed by the 32 bytes of its Ed25519 verifying key. The
//! `from` field of a signed message is therefore enough to check its
//! signature, and the wire carries no separate key.
//!
//! Inbound authors are checked with [`Identity::is_valid`] before any
//! signature work is done on their behalf.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// The local router's signing key.
#[derive(Clone)]
pub struct Keypair {
    secret: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity(self.secret.verifying_key().to_bytes())
    }

    pub fn sign(&self, bytes: &[u8]) -> Signature {
        self.secret.sign(bytes)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keypair({})", self.identity().short())
    }
}

/// Peer id: the raw bytes of an Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Leading 8 bytes as hex, used in log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Decodes the id as a verifying key. Weak (small-order) points count as
    /// undecodable: no honest signer can produce them.
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0)
            .ok()
            .filter(|key| !key.is_weak())
    }

    pub fn is_valid(&self) -> bool {
        self.verifying_key().is_some()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identities_differ_and_decode() {
        let a = Keypair::generate().identity();
        let b = Keypair::generate().identity();
        assert_ne!(a, b);
        assert!(a.is_valid());
        assert!(b.verifying_key().is_some());
    }

    #[test]
    fn small_order_ids_are_invalid() {
        // y = 0 and y = 1 both decode to torsion points.
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        let mut identity_point = [0u8; 32];
        identity_point[0] = 1;
        assert!(!Identity::from_bytes(identity_point).is_valid());
    }

    #[test]
    fn signature_checks_against_identity_key() {
        use ed25519_dalek::Verifier;

        let kp = Keypair::generate();
        let sig = kp.sign(b"hello mesh");
        let key = kp.identity().verifying_key().expect("valid key");
        assert!(key.verify(b"hello mesh", &sig).is_ok());
        assert!(key.verify(b"other", &sig).is_err());
    }

    #[test]
    fn debug_uses_short_form() {
        let id = Identity::from_bytes([0xAB; 32]);
        assert_eq!(id.short(), "abababababababab");
        assert_eq!(format!("{:?}", id), "Identity(abababababababab)");
        assert_eq!(id.as_bytes(), &[0xAB; 32]);
    }
}
