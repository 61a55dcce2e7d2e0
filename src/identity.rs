//! # Identity and Key Material
//!
//! This module defines the identity types used throughout servmesh:
//!
//! - [`Keypair`]: Ed25519 signing keypair
//! - [`SecretKey`]: the 64-byte serialized keypair handed to [`crate::NodeConfig`]
//! - [`PublicKey`]: 32-byte public key, the routing key of a peer
//! - [`Identity`]: public key plus the network address the peer can be dialed on
//!
//! ## Identity Model
//!
//! **Identity = Ed25519 Public Key + address.** Identities are self-certifying:
//! a peer proves it owns a key by signing its handshake with it, so no external
//! authority is needed. Public keys double as Kademlia keys, so the XOR distance
//! between two identities is the XOR of their public keys read as a big-endian
//! unsigned integer.
//!
//! ## Invariants
//!
//! - `PublicKey::from_bytes(b).as_bytes() == b`
//! - `a.distance(b) == b.distance(a)` and `a.distance(a) == 0`
//! - `Identity` values are immutable once created

use std::cmp::Ordering;
use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

/// Length of a public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of a serialized [`SecretKey`] (seed followed by public key).
pub const SECRET_KEY_LEN: usize = 64;

/// An XOR distance between two keys.
pub type Distance = [u8; PUBLIC_KEY_LEN];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &PublicKey) -> Distance {
        let mut out = [0u8; PUBLIC_KEY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// First eight bytes in hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; PUBLIC_KEY_LEN]> for PublicKey {
    fn from(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Compare two XOR distances as big-endian unsigned integers.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    for i in 0..PUBLIC_KEY_LEN {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// A peer: its public key and the address it accepts connections on.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    key: PublicKey,
    host: String,
    port: u16,
}

impl Identity {
    pub fn new(key: PublicKey, host: impl Into<String>, port: u16) -> Self {
        Self {
            key,
            host: host.into(),
            port,
        }
    }

    /// Build an identity from a `host:port` (or `[v6]:port`) address.
    pub fn with_addr(key: PublicKey, addr: &str) -> Result<Self> {
        let (host, port) = split_host_port(addr)?;
        Ok(Self::new(key, host, port))
    }

    #[inline]
    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The dialable `host:port` form of this identity's address.
    pub fn addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    #[inline]
    pub fn distance(&self, other: &Identity) -> Distance {
        self.key.xor_distance(&other.key)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}@{})", self.key.short(), self.addr())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr(), self.key)
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let invalid = || Error::InvalidAddress(addr.to_string());
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

/// Serialized Ed25519 keypair: 32-byte seed followed by the 32-byte public key.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; SECRET_KEY_LEN]);

impl SecretKey {
    pub fn from_bytes(bytes: [u8; SECRET_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidSecretKey)?;
        let arr: [u8; SECRET_KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidSecretKey)?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey").finish_non_exhaustive()
    }
}

/// Generate a fresh 64-byte secret key.
pub fn generate_secret_key() -> SecretKey {
    Keypair::generate().secret_key()
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore a keypair, rejecting secrets whose public half does not match the seed.
    pub fn from_secret_key(secret: &SecretKey) -> Result<Self> {
        let signing_key =
            SigningKey::from_keypair_bytes(secret.as_bytes()).map_err(|_| Error::InvalidSecretKey)?;
        Ok(Self { signing_key })
    }

    pub fn secret_key(&self) -> SecretKey {
        SecretKey(self.signing_key.to_keypair_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key().short())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> PublicKey {
        let mut bytes = [0u8; 32];
        bytes[0] = seed;
        bytes[31] = seed.wrapping_mul(7);
        PublicKey::from_bytes(bytes)
    }

    #[test]
    fn distance_is_symmetric_and_zero_to_self() {
        let a = Identity::new(key(1), "127.0.0.1", 9000);
        let b = Identity::new(key(200), "127.0.0.1", 9001);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; 32]);
    }

    #[test]
    fn distance_ignores_address() {
        let a = Identity::new(key(5), "10.0.0.1", 1);
        let b = Identity::new(key(5), "10.0.0.2", 2);
        assert_eq!(a.distance(&b), [0u8; 32]);
    }

    #[test]
    fn distance_cmp_orders_as_big_endian_integers() {
        let mut small = [0u8; 32];
        small[31] = 0xFF;
        let mut large = [0u8; 32];
        large[0] = 0x01;
        assert_eq!(distance_cmp(&small, &large), Ordering::Less);
        assert_eq!(distance_cmp(&large, &small), Ordering::Greater);
        assert_eq!(distance_cmp(&large, &large), Ordering::Equal);
    }

    #[test]
    fn public_key_hex_roundtrip() {
        let k = key(42);
        assert_eq!(PublicKey::from_hex(&k.to_hex()).unwrap(), k);
        assert!(PublicKey::from_hex("abcd").is_err());
    }

    #[test]
    fn identity_addr_formats() {
        let v4 = Identity::with_addr(key(1), "127.0.0.1:4000").unwrap();
        assert_eq!(v4.host(), "127.0.0.1");
        assert_eq!(v4.port(), 4000);
        assert_eq!(v4.addr(), "127.0.0.1:4000");

        let v6 = Identity::with_addr(key(1), "[::1]:4000").unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.addr(), "[::1]:4000");

        assert!(Identity::with_addr(key(1), "no-port").is_err());
        assert!(Identity::with_addr(key(1), ":80").is_err());
        assert!(Identity::with_addr(key(1), "host:99999").is_err());
    }

    #[test]
    fn secret_key_roundtrip() {
        let secret = generate_secret_key();
        let keypair = Keypair::from_secret_key(&secret).unwrap();
        assert_eq!(keypair.secret_key(), secret);
        assert_eq!(&secret.as_bytes()[32..], keypair.public_key().as_bytes());

        let restored = SecretKey::from_hex(&secret.to_hex()).unwrap();
        assert_eq!(restored, secret);
    }

    #[test]
    fn mismatched_secret_key_rejected() {
        let mut bytes = *generate_secret_key().as_bytes();
        bytes[40] ^= 0xFF;
        assert!(matches!(
            Keypair::from_secret_key(&SecretKey::from_bytes(bytes)),
            Err(Error::InvalidSecretKey)
        ));
    }

    #[test]
    fn keypair_signs_and_verifies() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"hello");
        assert!(keypair.verify(b"hello", &sig));
        assert!(!keypair.verify(b"other", &sig));
    }
}
