//! Drives the device-linking handshake and commits its result.
//!
//! Nothing is written locally until the handshake, push registration and
//! prekey upload have all succeeded. The commit is then a single SQLite
//! transaction, so a failed or superseded attempt leaves no trace.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection};
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};
use uuid::Uuid;

use crate::account::{AccountHandle, AccountState, DeviceIdentity};
use crate::config::LinkConfig;
use crate::crypto::keys::SIGNALING_KEY_LEN;
use crate::crypto::{generate_pre_keys, generate_registration_id, generate_secret, PreKeyBundle};
use crate::database::{lock, now_millis, SharedDatabase};
use crate::jobs::{Job, JobQueue, RetrieveProfileJob, SyncRequestJob};
use crate::linking::session::{LinkingSession, LinkingState};
use crate::linking::uri::provisioning_uri;
use crate::recipients::{IdentityStore, VerifiedStatus};
use crate::service::{AccountManager, Credentials, LinkCompletionRequest, PushTokenSource};
use crate::{DatabaseError, LinkError, Result};

const EVENT_CAPACITY: usize = 16;

/// Notifications for the pairing surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkingEvent {
    /// URI to show to the primary device.
    ProvisioningUri(String),
    Linked { account_id: String, device_id: u32 },
    /// The attempt ended; linking may be restarted.
    Failed(String),
}

#[derive(Default)]
struct Slot {
    /// Id of the attempt allowed to commit.
    current: u64,
    task: Option<AbortHandle>,
}

struct CoordinatorInner {
    db: SharedDatabase,
    account: AccountHandle,
    queue: JobQueue,
    config: Arc<LinkConfig>,
    manager: Arc<dyn AccountManager>,
    push: Arc<dyn PushTokenSource>,
    events: broadcast::Sender<LinkingEvent>,
    state: watch::Sender<LinkingState>,
    slot: Mutex<Slot>,
}

/// Single-slot linking supervisor. Cheap to clone.
#[derive(Clone)]
pub struct LinkingCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl LinkingCoordinator {
    pub fn new(
        db: SharedDatabase,
        account: AccountHandle,
        queue: JobQueue,
        config: Arc<LinkConfig>,
        manager: Arc<dyn AccountManager>,
        push: Arc<dyn PushTokenSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let initial = if account.is_linked() {
            LinkingState::Completed
        } else {
            LinkingState::Initiated
        };
        let (state, _) = watch::channel(initial);

        Self {
            inner: Arc::new(CoordinatorInner {
                db,
                account,
                queue,
                config,
                manager,
                push,
                events,
                state,
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkingEvent> {
        self.inner.events.subscribe()
    }

    /// State of the most recent attempt.
    pub fn state(&self) -> LinkingState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkingState> {
        self.inner.state.subscribe()
    }

    fn slot(&self) -> Result<MutexGuard<'_, Slot>> {
        self.inner
            .slot
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("linking slot".to_string()).into())
    }

    /// Start an attempt on a background task, superseding any attempt in
    /// flight. The superseded task is aborted and can no longer commit.
    pub fn start(&self) -> Result<JoinHandle<Result<DeviceIdentity>>> {
        let mut slot = self.slot()?;
        if let Some(previous) = slot.task.take() {
            info!("Superseding linking attempt {}", slot.current);
            previous.abort();
        }
        slot.current += 1;
        let attempt = slot.current;

        let this = self.clone();
        let task = tokio::spawn(async move { this.run_attempt(attempt).await });
        slot.task = Some(task.abort_handle());
        Ok(task)
    }

    /// Run an attempt on the caller's task. Also supersedes earlier attempts.
    pub async fn link(&self) -> Result<DeviceIdentity> {
        let attempt = {
            let mut slot = self.slot()?;
            if let Some(previous) = slot.task.take() {
                previous.abort();
            }
            slot.current += 1;
            slot.current
        };
        self.run_attempt(attempt).await
    }

    /// Abort the attempt in flight, if any.
    pub fn cancel(&self) -> Result<()> {
        let mut slot = self.slot()?;
        slot.current += 1;
        if let Some(task) = slot.task.take() {
            info!("Linking attempt cancelled");
            task.abort();
        }
        drop(slot);
        self.inner.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = LinkingState::Failed;
            true
        });
        Ok(())
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.slot().map(|s| s.current == attempt).unwrap_or(false)
    }

    fn set_state(&self, attempt: u64, state: LinkingState) {
        if self.is_current(attempt) {
            self.inner.state.send_replace(state);
        }
    }

    fn emit(&self, event: LinkingEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    async fn run_attempt(&self, attempt: u64) -> Result<DeviceIdentity> {
        let mut session = LinkingSession::new()?;
        self.set_state(attempt, session.state());

        match self.drive(&mut session, attempt).await {
            Ok(identity) => {
                session.complete()?;
                self.set_state(attempt, session.state());
                info!(
                    "Linked as device {} of {}",
                    identity.device_id, identity.account_id
                );
                self.emit(LinkingEvent::Linked {
                    account_id: identity.account_id.clone(),
                    device_id: identity.device_id,
                });
                Ok(identity)
            }
            Err(e) => {
                session.fail();
                if self.is_current(attempt) {
                    warn!("Linking failed: {}", e);
                    self.set_state(attempt, session.state());
                    self.emit(LinkingEvent::Failed(e.to_string()));
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, session: &mut LinkingSession, attempt: u64) -> Result<DeviceIdentity> {
        let handle = self
            .inner
            .manager
            .request_provisioning_handle(&session.ephemeral().password)
            .await?;
        let uri = provisioning_uri(&handle, &session.ephemeral().key_pair.public_key());
        session.publish_handle(handle.clone())?;
        self.set_state(attempt, session.state());
        self.emit(LinkingEvent::ProvisioningUri(uri));

        let signaling_key = generate_secret(SIGNALING_KEY_LEN)?;
        let registration_id = generate_registration_id();
        let request = LinkCompletionRequest {
            provisioning_handle: handle,
            ephemeral_public_key: session.ephemeral().key_pair.public_key(),
            password: session.ephemeral().password.clone(),
            signaling_key: signaling_key.clone(),
            registration_id,
            device_name: format!("{}-{}", self.inner.config.device_name_prefix, Uuid::new_v4()),
        };
        session.await_confirmation()?;
        self.set_state(attempt, session.state());
        let registration = self.inner.manager.await_link_completion(&request).await?;

        let password = session.ephemeral().password.clone();
        let credentials =
            Credentials::for_device(&registration.account_id, registration.device_id, &password);

        let push_token = self.inner.push.token().await?;
        self.inner
            .manager
            .register_push_token(&credentials, push_token.as_deref())
            .await?;

        let previous = self.inner.account.snapshot();
        let bundle = generate_pre_keys(
            &registration.identity_key_pair,
            previous.next_prekey_id,
            previous.next_signed_prekey_id,
            self.inner.config.prekey_batch_size,
        )?;
        self.inner
            .manager
            .upload_pre_keys(
                &credentials,
                &registration.identity_key_pair.public_key(),
                &bundle.signed,
                &bundle.one_time,
            )
            .await?;

        let sender_certificate = match self.inner.manager.sender_certificate(&credentials).await {
            Ok(certificate) => Some(certificate),
            Err(e) => {
                warn!("Sender certificate unavailable: {}", e);
                None
            }
        };

        let identity = DeviceIdentity {
            device_id: registration.device_id,
            account_id: registration.account_id,
            identity_key_pair: registration.identity_key_pair,
            registration_id,
            signaling_key,
            profile_key: registration.profile_key,
        };
        let push_disabled = push_token.is_none();
        let state = AccountState {
            identity: Some(identity.clone()),
            password: Some(password),
            push_token,
            sender_certificate,
            push_registered: true,
            signed_prekey_registered: true,
            websocket_registered: push_disabled,
            multi_device: true,
            push_disabled,
            unauthorized_received: false,
            next_prekey_id: bundle.next_one_time_id,
            next_signed_prekey_id: bundle.next_signed_id,
            linked_at: Some(now_millis()),
        };

        self.commit(attempt, state, &bundle)?;
        Ok(identity)
    }

    /// Write everything the attempt produced in one transaction, provided the
    /// attempt has not been superseded.
    fn commit(&self, attempt: u64, state: AccountState, bundle: &PreKeyBundle) -> Result<()> {
        let slot = self.slot()?;
        if slot.current != attempt {
            return Err(LinkError::Cancelled);
        }
        let Some(identity) = state.identity.as_ref() else {
            return Err(LinkError::InvalidInput("commit without identity".to_string()));
        };

        let db = lock(&self.inner.db, "commit link")?;
        let tx = db
            .conn()
            .unchecked_transaction()
            .map_err(DatabaseError::Sqlite)?;

        state.save(&tx)?;
        IdentityStore::save_identity(
            &tx,
            &identity.account_id,
            &identity.identity_key_pair.public_key(),
            VerifiedStatus::Verified,
            true,
            now_millis(),
            true,
        )?;
        store_pre_keys(&tx, bundle)?;

        JobQueue::insert_record(
            &tx,
            &Job::RetrieveProfile(RetrieveProfileJob::new(identity.account_id.as_str())),
        )?;
        for job in SyncRequestJob::all() {
            JobQueue::insert_record(&tx, &Job::SyncRequest(job))?;
        }

        tx.commit().map_err(DatabaseError::Sqlite)?;
        drop(db);
        drop(slot);

        self.inner.account.replace(state);
        self.inner.queue.notify();
        Ok(())
    }
}

/// Replace stored prekeys with `bundle`. Keys from an earlier identity are
/// useless once the new identity is committed.
fn store_pre_keys(conn: &Connection, bundle: &PreKeyBundle) -> Result<()> {
    let now = now_millis();
    conn.execute("DELETE FROM prekeys", [])
        .map_err(DatabaseError::Sqlite)?;

    let mut stmt = conn
        .prepare(
            "INSERT INTO prekeys (prekey_id, signed, public_key, private_key, signature, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .map_err(DatabaseError::Sqlite)?;

    for key in &bundle.one_time {
        stmt.execute(params![
            key.id,
            false,
            key.public_key().to_vec(),
            key.secret_bytes().to_vec(),
            Option::<Vec<u8>>::None,
            now,
        ])
        .map_err(DatabaseError::Sqlite)?;
    }

    let signed = &bundle.signed;
    stmt.execute(params![
        signed.id,
        true,
        signed.public_key().to_vec(),
        signed.secret_bytes().to_vec(),
        Some(signed.signature.to_vec()),
        signed.timestamp,
    ])
    .map_err(DatabaseError::Sqlite)?;

    Ok(())
}
