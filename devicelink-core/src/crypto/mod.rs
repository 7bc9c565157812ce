//! Key material used while linking a device.
//!
//! This module provides:
//! - Ed25519 identity key pairs (ephemeral during the handshake, permanent after)
//! - random transport passwords, signaling keys and registration ids
//! - X25519 one-time and signed prekeys

pub mod keys;
pub mod prekeys;

pub use keys::{
    generate_ephemeral_identity, generate_registration_id, generate_secret, EphemeralIdentity,
    IdentityKeyPair, ProfileKey, PublicIdentityKey,
};
pub use prekeys::{generate_pre_keys, OneTimePreKey, PreKeyBundle, SignedPreKey};

use thiserror::Error;

/// Errors that can occur while generating or decoding key material
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Random number generation failed: {0}")]
    RandomFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    BadSignature,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Fill `buf` from the OS RNG, surfacing failure instead of panicking.
pub(crate) fn fill_random(buf: &mut [u8]) -> Result<()> {
    use rand::RngCore;
    rand::rngs::OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CryptoError::RandomFailed(e.to_string()))
}

pub(crate) fn to_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: N,
        got: bytes.len(),
    })
}
