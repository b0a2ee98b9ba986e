//! Message signatures.
//!
//! Signed bytes always start with a protocol domain, so a signature made for
//! a gossip message verifies nowhere else. Verification is `verify_strict`,
//! which also refuses malleable signatures.

use ed25519_dalek::Signature;
use thiserror::Error;

use crate::identity::{Identity, Keypair};

/// Domain prefix for message signatures.
pub const GOSSIPSUB_SIGNATURE_DOMAIN: &[u8] = b"meshsub-message-v1:";

/// Domain prefix for message id hashing.
pub const MESSAGE_ID_DOMAIN: &[u8] = b"meshsub-msgid-v1:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature must be 64 bytes, got {0}")]
    InvalidLength(usize),
    #[error("author is not a usable Ed25519 key")]
    InvalidPublicKey,
    #[error("signature does not verify")]
    VerificationFailed,
}

fn domain_prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + data.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(data);
    buf
}

/// Signs `domain || data`. The result is always 64 bytes.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&domain_prefixed(domain, data)).to_bytes().to_vec()
}

pub fn verify_with_domain(
    author: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let raw: &[u8; 64] = match signature.len() {
        0 => return Err(SignatureError::Missing),
        _ => signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength(signature.len()))?,
    };
    let key = author.verifying_key().ok_or(SignatureError::InvalidPublicKey)?;
    key.verify_strict(&domain_prefixed(domain, data), &Signature::from_bytes(raw))
        .map_err(|_| SignatureError::VerificationFailed)
}

/// Bytes covered by a message signature:
/// `from(32) || seqno(u64 BE) || len(topic) || topic || len(data) || data`,
/// lengths as u32 BE.
pub fn build_signed_payload(from: &Identity, seqno: u64, topic: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(48 + topic.len() + data.len());
    out.extend_from_slice(from.as_bytes());
    out.extend_from_slice(&seqno.to_be_bytes());
    for field in [topic.as_bytes(), data] {
        out.extend_from_slice(&(field.len() as u32).to_be_bytes());
        out.extend_from_slice(field);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_and_verifies_under_one_domain_only() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, GOSSIPSUB_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(sig.len(), 64);
        assert_eq!(verify_with_domain(&kp.identity(), GOSSIPSUB_SIGNATURE_DOMAIN, b"payload", &sig), Ok(()));
        assert_eq!(
            verify_with_domain(&kp.identity(), MESSAGE_ID_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_are_classified() {
        let id = Keypair::generate().identity();
        assert_eq!(
            verify_with_domain(&id, GOSSIPSUB_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&id, GOSSIPSUB_SIGNATURE_DOMAIN, b"x", &[0u8; 32]),
            Err(SignatureError::InvalidLength(32))
        );
        assert_eq!(SignatureError::InvalidLength(32).to_string(), "signature must be 64 bytes, got 32");
    }

    #[test]
    fn undecodable_author_is_reported() {
        let kp = Keypair::generate();
        let sig = sign_with_domain(&kp, GOSSIPSUB_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&Identity::from_bytes([0u8; 32]), GOSSIPSUB_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::InvalidPublicKey)
        );
    }

    #[test]
    fn other_signer_fails() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sig = sign_with_domain(&kp, GOSSIPSUB_SIGNATURE_DOMAIN, b"payload");
        assert!(verify_with_domain(&other.identity(), GOSSIPSUB_SIGNATURE_DOMAIN, b"payload", &sig).is_err());
    }

    #[test]
    fn field_boundaries_change_the_payload() {
        let from = Keypair::generate().identity();
        assert_ne!(build_signed_payload(&from, 1, "ab", b"c"), build_signed_payload(&from, 1, "a", b"bc"));
        assert_ne!(build_signed_payload(&from, 1, "t", b"d"), build_signed_payload(&from, 2, "t", b"d"));
        assert_eq!(build_signed_payload(&from, 7, "t", b"d").len(), 32 + 8 + 4 + 1 + 4 + 1);
    }
}
