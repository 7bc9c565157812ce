//! Identity keys, profile keys and the random secrets handed out during linking.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{fill_random, to_array, CryptoError, Result};

/// Length in bytes of the transport password secret.
pub const PASSWORD_SECRET_LEN: usize = 18;
/// Length in bytes of the signaling key secret.
pub const SIGNALING_KEY_LEN: usize = 52;
/// Registration ids are drawn from `1..=MAX_REGISTRATION_ID`.
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// Public half of an identity key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicIdentityKey([u8; 32]);

impl PublicIdentityKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = to_array::<32>(bytes)?;
        VerifyingKey::from_bytes(&key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let vk = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(&to_array::<64>(signature)?);
        vk.verify(message, &sig).map_err(|_| CryptoError::BadSignature)
    }
}

/// An Ed25519 identity key pair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Result<Self> {
        let mut secret = [0u8; 32];
        fill_random(&mut secret)?;
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Ok(Self { signing_key })
    }

    pub fn from_private_bytes(bytes: &[u8]) -> Result<Self> {
        let mut secret = to_array::<32>(bytes)?;
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Ok(Self { signing_key })
    }

    pub fn public_key(&self) -> PublicIdentityKey {
        PublicIdentityKey(self.signing_key.verifying_key().to_bytes())
    }

    /// Raw private key bytes (use sparingly)
    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// 32-byte key used to encrypt and decrypt profile data.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ProfileKey([u8; 32]);

impl ProfileKey {
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        fill_random(&mut key)?;
        Ok(Self(key))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self(to_array::<32>(bytes)?))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("profile key: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for ProfileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProfileKey(..)")
    }
}

/// Throwaway identity that only lives for one linking attempt.
#[derive(Debug)]
pub struct EphemeralIdentity {
    pub key_pair: IdentityKeyPair,
    pub password: String,
}

/// Fresh key pair plus transport password. Nothing here is persisted.
pub fn generate_ephemeral_identity() -> Result<EphemeralIdentity> {
    Ok(EphemeralIdentity {
        key_pair: IdentityKeyPair::generate()?,
        password: generate_secret(PASSWORD_SECRET_LEN)?,
    })
}

/// `len` random bytes, base64 encoded.
pub fn generate_secret(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    fill_random(&mut bytes)?;
    let secret = STANDARD.encode(&bytes);
    bytes.zeroize();
    Ok(secret)
}

pub fn generate_registration_id() -> u32 {
    rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID)
}
