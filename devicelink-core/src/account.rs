//! Account state of this device, stored in the single `account_state` row.
//!
//! The state is written by the linking commit and by profile-key rotation.
//! Everything else reads it through a cloned [`AccountHandle`].

use std::sync::{Arc, RwLock};

use rusqlite::{Connection, OptionalExtension};

use crate::crypto::{IdentityKeyPair, ProfileKey};
use crate::database::{lock, SharedDatabase};
use crate::{DatabaseError, Result};

/// Permanent identity of this device, known once linking completes.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub device_id: u32,
    /// Phone number or account identifier of the owning account.
    pub account_id: String,
    pub identity_key_pair: IdentityKeyPair,
    pub registration_id: u32,
    pub signaling_key: String,
    pub profile_key: ProfileKey,
}

/// Everything the process knows about the local account.
#[derive(Debug, Clone, Default)]
pub struct AccountState {
    pub identity: Option<DeviceIdentity>,
    /// Transport password chosen during linking.
    pub password: Option<String>,
    pub push_token: Option<String>,
    /// Unidentified-access sender certificate.
    pub sender_certificate: Option<Vec<u8>>,
    pub push_registered: bool,
    pub signed_prekey_registered: bool,
    pub websocket_registered: bool,
    pub multi_device: bool,
    pub push_disabled: bool,
    pub unauthorized_received: bool,
    pub next_prekey_id: u32,
    pub next_signed_prekey_id: u32,
    pub linked_at: Option<i64>,
}

impl AccountState {
    /// True once the device holds an identity and has finished registration.
    pub fn is_linked(&self) -> bool {
        self.identity.is_some() && self.push_registered && self.signed_prekey_registered
    }

    pub fn local_identifier(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.account_id.as_str())
    }

    /// Load the account row. Returns default (unlinked) state if no row exists.
    pub fn load(conn: &Connection) -> Result<Self> {
        let row = conn
            .query_row(
                "SELECT device_id, account_id, identity_private_key, registration_id,
                        signaling_key, profile_key, password, push_token, sender_certificate,
                        push_registered, signed_prekey_registered, websocket_registered,
                        multi_device, push_disabled, unauthorized_received,
                        next_prekey_id, next_signed_prekey_id, linked_at
                 FROM account_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        (
                            row.get::<_, Option<u32>>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<Vec<u8>>>(2)?,
                            row.get::<_, Option<u32>>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<Vec<u8>>>(5)?,
                        ),
                        AccountState {
                            identity: None,
                            password: row.get(6)?,
                            push_token: row.get(7)?,
                            sender_certificate: row.get(8)?,
                            push_registered: row.get(9)?,
                            signed_prekey_registered: row.get(10)?,
                            websocket_registered: row.get(11)?,
                            multi_device: row.get(12)?,
                            push_disabled: row.get(13)?,
                            unauthorized_received: row.get(14)?,
                            next_prekey_id: row.get(15)?,
                            next_signed_prekey_id: row.get(16)?,
                            linked_at: row.get(17)?,
                        },
                    ))
                },
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        let Some((identity_cols, mut state)) = row else {
            return Ok(Self::default());
        };

        if let (
            Some(device_id),
            Some(account_id),
            Some(private_key),
            Some(registration_id),
            Some(signaling_key),
            Some(profile_key),
        ) = identity_cols
        {
            state.identity = Some(DeviceIdentity {
                device_id,
                account_id,
                identity_key_pair: IdentityKeyPair::from_private_bytes(&private_key)?,
                registration_id,
                signaling_key,
                profile_key: ProfileKey::from_bytes(&profile_key)?,
            });
        }

        Ok(state)
    }

    /// Save the account row (upsert).
    pub fn save(&self, conn: &Connection) -> Result<()> {
        let identity = self.identity.as_ref();
        conn.execute(
            "INSERT INTO account_state (id, device_id, account_id, identity_private_key,
                    registration_id, signaling_key, profile_key, password, push_token,
                    sender_certificate, push_registered, signed_prekey_registered,
                    websocket_registered, multi_device, push_disabled, unauthorized_received,
                    next_prekey_id, next_signed_prekey_id, linked_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(id) DO UPDATE SET
                device_id = excluded.device_id,
                account_id = excluded.account_id,
                identity_private_key = excluded.identity_private_key,
                registration_id = excluded.registration_id,
                signaling_key = excluded.signaling_key,
                profile_key = excluded.profile_key,
                password = excluded.password,
                push_token = excluded.push_token,
                sender_certificate = excluded.sender_certificate,
                push_registered = excluded.push_registered,
                signed_prekey_registered = excluded.signed_prekey_registered,
                websocket_registered = excluded.websocket_registered,
                multi_device = excluded.multi_device,
                push_disabled = excluded.push_disabled,
                unauthorized_received = excluded.unauthorized_received,
                next_prekey_id = excluded.next_prekey_id,
                next_signed_prekey_id = excluded.next_signed_prekey_id,
                linked_at = excluded.linked_at",
            rusqlite::params![
                identity.map(|i| i.device_id),
                identity.map(|i| i.account_id.clone()),
                identity.map(|i| i.identity_key_pair.private_bytes().to_vec()),
                identity.map(|i| i.registration_id),
                identity.map(|i| i.signaling_key.clone()),
                identity.map(|i| i.profile_key.as_bytes().to_vec()),
                self.password,
                self.push_token,
                self.sender_certificate,
                self.push_registered,
                self.signed_prekey_registered,
                self.websocket_registered,
                self.multi_device,
                self.push_disabled,
                self.unauthorized_received,
                self.next_prekey_id,
                self.next_signed_prekey_id,
                self.linked_at,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;

        Ok(())
    }
}

/// Shared, injected view of the account state.
#[derive(Debug, Clone, Default)]
pub struct AccountHandle {
    inner: Arc<RwLock<AccountState>>,
}

impl AccountHandle {
    pub fn new(state: AccountState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn load(db: &SharedDatabase) -> Result<Self> {
        let db = lock(db, "load account")?;
        Ok(Self::new(AccountState::load(db.conn())?))
    }

    pub fn snapshot(&self) -> AccountState {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn local_identifier(&self) -> Option<String> {
        self.snapshot().local_identifier().map(str::to_string)
    }

    pub fn profile_key(&self) -> Option<ProfileKey> {
        self.snapshot().identity.map(|i| i.profile_key)
    }

    pub fn is_linked(&self) -> bool {
        self.snapshot().is_linked()
    }

    /// Swap in freshly committed state. Only the linking commit calls this.
    pub(crate) fn replace(&self, state: AccountState) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Persist a rotated profile key, then expose it to readers.
    pub fn rotate_profile_key(&self, db: &SharedDatabase, key: ProfileKey) -> Result<()> {
        let mut state = self.snapshot();
        let Some(identity) = state.identity.as_mut() else {
            return Err(crate::LinkError::NotFound("account is not linked".to_string()));
        };
        identity.profile_key = key;

        let guard = lock(db, "rotate profile key")?;
        state.save(guard.conn())?;
        drop(guard);

        self.replace(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{shared, Database};

    fn linked_state() -> AccountState {
        AccountState {
            identity: Some(DeviceIdentity {
                device_id: 2,
                account_id: "+15550001111".to_string(),
                identity_key_pair: IdentityKeyPair::generate().unwrap(),
                registration_id: 1234,
                signaling_key: "c2lnbmFsaW5n".to_string(),
                profile_key: ProfileKey::generate().unwrap(),
            }),
            password: Some("secret".to_string()),
            push_registered: true,
            signed_prekey_registered: true,
            multi_device: true,
            next_prekey_id: 101,
            next_signed_prekey_id: 2,
            ..AccountState::default()
        }
    }

    #[test]
    fn load_from_empty_db_returns_default() {
        let db = Database::in_memory().unwrap();
        let state = AccountState::load(db.conn()).unwrap();
        assert!(state.identity.is_none());
        assert!(!state.is_linked());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let db = Database::in_memory().unwrap();
        let state = linked_state();
        state.save(db.conn()).unwrap();

        let loaded = AccountState::load(db.conn()).unwrap();
        let original = state.identity.as_ref().unwrap();
        let restored = loaded.identity.as_ref().unwrap();
        assert_eq!(restored.device_id, 2);
        assert_eq!(restored.account_id, "+15550001111");
        assert_eq!(
            restored.identity_key_pair.public_key(),
            original.identity_key_pair.public_key()
        );
        assert_eq!(restored.profile_key, original.profile_key);
        assert!(loaded.is_linked());
        assert_eq!(loaded.next_prekey_id, 101);
    }

    #[test]
    fn save_twice_keeps_single_row() {
        let db = Database::in_memory().unwrap();
        linked_state().save(db.conn()).unwrap();
        linked_state().save(db.conn()).unwrap();
        let rows: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM account_state", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn rotate_profile_key_updates_store_and_handle() {
        let db = shared(Database::in_memory().unwrap());
        linked_state().save(lock(&db, "test").unwrap().conn()).unwrap();
        let handle = AccountHandle::load(&db).unwrap();

        let fresh = ProfileKey::generate().unwrap();
        handle.rotate_profile_key(&db, fresh.clone()).unwrap();

        assert_eq!(handle.profile_key(), Some(fresh.clone()));
        let stored = AccountState::load(lock(&db, "test").unwrap().conn()).unwrap();
        assert_eq!(stored.identity.unwrap().profile_key, fresh);
    }

    #[test]
    fn rotate_profile_key_requires_identity() {
        let db = shared(Database::in_memory().unwrap());
        let handle = AccountHandle::default();
        let err = handle
            .rotate_profile_key(&db, ProfileKey::generate().unwrap())
            .unwrap_err();
        assert!(matches!(err, crate::LinkError::NotFound(_)));
    }
}
