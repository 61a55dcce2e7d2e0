//! # Signatures
//!
//! Domain-separated Ed25519 signing used to make handshakes self-certifying:
//! a peer proves control of its identity by signing its handshake payload with
//! the secret half of the public key it advertises. No CA is involved.
//!
//! - **Identity = Public Key**: the 32-byte Ed25519 public key IS the peer's key
//! - Only 64-byte Ed25519 signatures are accepted, verified with `verify_strict`
//! - Domain separation prevents a signature from one context being replayed in another

use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

use crate::identity::{Keypair, PublicKey};

/// Length of a detached Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Domain separation prefix for handshake signatures.
pub const HANDSHAKE_SIGNATURE_DOMAIN: &[u8] = b"servmesh-handshake-v1:";

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Sign `data` prefixed with `domain`.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes()
}

/// Verify a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    key: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key =
        VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, HANDSHAKE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&keypair.public_key(), HANDSHAKE_SIGNATURE_DOMAIN, b"payload", &sig),
            Ok(())
        );
    }

    #[test]
    fn domain_separation_prevents_replay() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, b"other-domain:", b"payload");
        assert_eq!(
            verify_with_domain(&keypair.public_key(), HANDSHAKE_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn tampered_payload_rejected() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, HANDSHAKE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&keypair.public_key(), HANDSHAKE_SIGNATURE_DOMAIN, b"payl0ad", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_signer_rejected() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let sig = sign_with_domain(&signer, HANDSHAKE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            verify_with_domain(&other.public_key(), HANDSHAKE_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_rejected() {
        let keypair = Keypair::generate();
        let key = keypair.public_key();
        assert_eq!(
            verify_with_domain(&key, HANDSHAKE_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&key, HANDSHAKE_SIGNATURE_DOMAIN, b"x", &[0u8; 63]),
            Err(SignatureError::InvalidLength)
        );
    }
}
