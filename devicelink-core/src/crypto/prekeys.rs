//! One-time and signed prekeys published after the permanent identity is known.

use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{fill_random, IdentityKeyPair, Result};

/// Prekey ids wrap inside `1..MAX_PREKEY_ID`.
pub const MAX_PREKEY_ID: u32 = 0x00FF_FFFF;

/// An X25519 key pair tagged with its prekey id.
#[derive(Clone)]
pub struct OneTimePreKey {
    pub id: u32,
    secret: StaticSecret,
}

impl OneTimePreKey {
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// A prekey whose public half is signed by the identity key.
#[derive(Clone)]
pub struct SignedPreKey {
    pub id: u32,
    secret: StaticSecret,
    pub signature: [u8; 64],
    pub timestamp: i64,
}

impl SignedPreKey {
    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(&self.secret).to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// A batch of one-time prekeys plus one signed prekey.
#[derive(Clone)]
pub struct PreKeyBundle {
    pub one_time: Vec<OneTimePreKey>,
    pub signed: SignedPreKey,
    /// Id to continue from on the next batch.
    pub next_one_time_id: u32,
    pub next_signed_id: u32,
}

fn random_secret() -> Result<StaticSecret> {
    let mut bytes = [0u8; 32];
    fill_random(&mut bytes)?;
    Ok(StaticSecret::from(bytes))
}

fn wrap_id(start: u32, offset: u32) -> u32 {
    let base = start.max(1) - 1;
    (base.wrapping_add(offset)) % (MAX_PREKEY_ID - 1) + 1
}

/// Generate `count` one-time prekeys starting at `start_id` and one signed prekey
/// with id `signed_id`, signed by the permanent `identity`.
///
/// Any RNG failure aborts the whole batch so no partial key material escapes.
pub fn generate_pre_keys(
    identity: &IdentityKeyPair,
    start_id: u32,
    signed_id: u32,
    count: u32,
) -> Result<PreKeyBundle> {
    let one_time = (0..count)
        .map(|i| {
            Ok(OneTimePreKey {
                id: wrap_id(start_id, i),
                secret: random_secret()?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let secret = random_secret()?;
    let signature = identity.sign(&PublicKey::from(&secret).to_bytes());
    let signed = SignedPreKey {
        id: wrap_id(signed_id, 0),
        secret,
        signature,
        timestamp: chrono::Utc::now().timestamp_millis(),
    };

    Ok(PreKeyBundle {
        one_time,
        signed,
        next_one_time_id: wrap_id(start_id, count),
        next_signed_id: wrap_id(signed_id, 1),
    })
}
