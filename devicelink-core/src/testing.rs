//! Recording collaborators and fixtures for tests.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::account::{AccountHandle, AccountState, DeviceIdentity};
use crate::config::LinkConfig;
use crate::crypto::{IdentityKeyPair, OneTimePreKey, ProfileKey, PublicIdentityKey, SignedPreKey};
use crate::database::{lock, shared, Database, SharedDatabase};
use crate::jobs::{JobContext, JobQueue};
use crate::service::{
    AccountManager, AttachmentPointer, Credentials, DirectoryService, LinkCompletionRequest,
    MessageTransport, NewDeviceRegistration, Profile, ProfileService, PushTokenSource,
};
use crate::sync::SyncRequestEnvelope;
use crate::{LinkError, Result};

pub(crate) const LOCAL_NUMBER: &str = "+15550100000";

/// Config with instant retries and a short idle poll.
pub(crate) fn test_config(cache_dir: &Path) -> LinkConfig {
    LinkConfig {
        cache_dir: cache_dir.to_path_buf(),
        database_path: cache_dir.join("account.db"),
        prekey_batch_size: 10,
        job_workers: 2,
        job_idle_poll_ms: 20,
        retry_backoff_base_secs: 0,
        retry_backoff_max_secs: 0,
        ..LinkConfig::default()
    }
}

#[derive(Default)]
pub(crate) struct MockTransport {
    pub sent: Mutex<Vec<SyncRequestEnvelope>>,
    pub fail_sends: Mutex<bool>,
    pub attachment: Mutex<Vec<u8>>,
    /// Errors returned by the next downloads, in order.
    pub download_errors: Mutex<Vec<LinkError>>,
    pub downloads: AtomicUsize,
}

impl MockTransport {
    pub fn sent(&self) -> Vec<SyncRequestEnvelope> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageTransport for MockTransport {
    async fn send(
        &self,
        envelope: SyncRequestEnvelope,
        _target: Option<&PublicIdentityKey>,
    ) -> Result<()> {
        self.sent.lock().unwrap().push(envelope);
        if *self.fail_sends.lock().unwrap() {
            return Err(LinkError::Network("socket closed".to_string()));
        }
        Ok(())
    }

    async fn retrieve_attachment(
        &self,
        _pointer: &AttachmentPointer,
        destination: &Path,
        _size_limit: u64,
    ) -> Result<Box<dyn Read + Send>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        {
            let mut errors = self.download_errors.lock().unwrap();
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        let bytes = self.attachment.lock().unwrap().clone();
        std::fs::write(destination, &bytes)?;
        Ok(Box::new(Cursor::new(bytes)))
    }
}

#[derive(Default)]
pub(crate) struct MockDirectory {
    pub refreshed: Mutex<Vec<String>>,
}

#[async_trait]
impl DirectoryService for MockDirectory {
    async fn refresh(&self, identifier: &str) -> Result<bool> {
        self.refreshed.lock().unwrap().push(identifier.to_string());
        Ok(true)
    }
}

#[derive(Default)]
pub(crate) struct MockProfiles {
    pub requests: Mutex<Vec<(String, Option<ProfileKey>)>>,
}

#[async_trait]
impl ProfileService for MockProfiles {
    async fn retrieve_profile(
        &self,
        identifier: &str,
        profile_key: Option<&ProfileKey>,
    ) -> Result<Profile> {
        self.requests
            .lock()
            .unwrap()
            .push((identifier.to_string(), profile_key.cloned()));
        Ok(Profile {
            name: Some(format!("Profile of {}", identifier)),
        })
    }
}

pub(crate) struct StaticPushToken(pub Option<String>);

#[async_trait]
impl PushTokenSource for StaticPushToken {
    async fn token(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Scripted account-management endpoint.
pub(crate) struct MockAccountManager {
    pub registration: NewDeviceRegistration,
    pub handles_issued: AtomicUsize,
    pub completion_calls: AtomicUsize,
    /// Completion calls that time out before one succeeds.
    pub completion_timeouts: AtomicUsize,
    pub push_registrations: Mutex<Vec<Option<String>>>,
    /// Sizes of uploaded one-time prekey batches.
    pub prekey_uploads: Mutex<Vec<usize>>,
    pub reject_prekeys: Mutex<bool>,
    /// When set, completion waits for a permit; `entered` fires first.
    pub gate: Option<Arc<Semaphore>>,
    pub entered: Notify,
}

impl MockAccountManager {
    pub fn new() -> Self {
        Self {
            registration: NewDeviceRegistration {
                device_id: 2,
                account_id: LOCAL_NUMBER.to_string(),
                identity_key_pair: IdentityKeyPair::generate().unwrap(),
                profile_key: ProfileKey::generate().unwrap(),
            },
            handles_issued: AtomicUsize::new(0),
            completion_calls: AtomicUsize::new(0),
            completion_timeouts: AtomicUsize::new(0),
            push_registrations: Mutex::new(Vec::new()),
            prekey_uploads: Mutex::new(Vec::new()),
            reject_prekeys: Mutex::new(false),
            gate: None,
            entered: Notify::new(),
        }
    }

    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let manager = Self {
            gate: Some(gate.clone()),
            ..Self::new()
        };
        (manager, gate)
    }
}

#[async_trait]
impl AccountManager for MockAccountManager {
    async fn request_provisioning_handle(&self, _password: &str) -> Result<String> {
        let n = self.handles_issued.fetch_add(1, Ordering::SeqCst);
        Ok(format!("handle-{}", n))
    }

    async fn await_link_completion(
        &self,
        _request: &LinkCompletionRequest,
    ) -> Result<NewDeviceRegistration> {
        self.completion_calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| LinkError::Network("gate closed".to_string()))?;
            permit.forget();
        }
        let timeouts_left = self.completion_timeouts.load(Ordering::SeqCst);
        if timeouts_left > 0 {
            self.completion_timeouts.store(timeouts_left - 1, Ordering::SeqCst);
            return Err(LinkError::Timeout("awaiting primary device".to_string()));
        }
        Ok(self.registration.clone())
    }

    async fn register_push_token(
        &self,
        _credentials: &Credentials,
        token: Option<&str>,
    ) -> Result<()> {
        self.push_registrations
            .lock()
            .unwrap()
            .push(token.map(str::to_string));
        Ok(())
    }

    async fn upload_pre_keys(
        &self,
        _credentials: &Credentials,
        _identity_key: &PublicIdentityKey,
        _signed_pre_key: &SignedPreKey,
        one_time_pre_keys: &[OneTimePreKey],
    ) -> Result<()> {
        if *self.reject_prekeys.lock().unwrap() {
            return Err(LinkError::UntrustedIdentity("identity key mismatch".to_string()));
        }
        self.prekey_uploads.lock().unwrap().push(one_time_pre_keys.len());
        Ok(())
    }

    async fn sender_certificate(&self, _credentials: &Credentials) -> Result<Vec<u8>> {
        Ok(vec![0xce, 0x57])
    }
}

/// Database, queue, account and mocks wired together.
pub(crate) struct Harness {
    pub db: SharedDatabase,
    pub account: AccountHandle,
    pub queue: JobQueue,
    pub config: Arc<LinkConfig>,
    pub transport: Arc<MockTransport>,
    pub directory: Arc<MockDirectory>,
    pub profiles: Arc<MockProfiles>,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::with_database(dir, Database::in_memory().unwrap())
    }

    /// Harness over an on-disk database inside `dir`.
    pub fn on_disk(dir: tempfile::TempDir) -> Self {
        let db = Database::open(dir.path().join("account.db")).unwrap();
        Self::with_database(dir, db)
    }

    fn with_database(dir: tempfile::TempDir, db: Database) -> Self {
        let config = Arc::new(test_config(dir.path()));
        let db = shared(db);
        let account = AccountHandle::load(&db).unwrap();
        let queue = JobQueue::new(db.clone(), &config).unwrap();
        Self {
            db,
            account,
            queue,
            config,
            transport: Arc::new(MockTransport::default()),
            directory: Arc::new(MockDirectory::default()),
            profiles: Arc::new(MockProfiles::default()),
            dir,
        }
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            db: self.db.clone(),
            account: self.account.clone(),
            queue: self.queue.clone(),
            config: self.config.clone(),
            transport: self.transport.clone(),
            directory: self.directory.clone(),
            profiles: self.profiles.clone(),
        }
    }

    /// Store a linked account for [`LOCAL_NUMBER`] and return its profile key.
    pub fn link_account(&self) -> ProfileKey {
        let profile_key = ProfileKey::generate().unwrap();
        let state = AccountState {
            identity: Some(DeviceIdentity {
                device_id: 2,
                account_id: LOCAL_NUMBER.to_string(),
                identity_key_pair: IdentityKeyPair::generate().unwrap(),
                registration_id: 77,
                signaling_key: "c2lnbmFsaW5n".to_string(),
                profile_key: profile_key.clone(),
            }),
            push_registered: true,
            signed_prekey_registered: true,
            ..AccountState::default()
        };
        state.save(lock(&self.db, "test").unwrap().conn()).unwrap();
        self.account.replace(state);
        profile_key
    }

    pub fn factory_keys(&self) -> Vec<String> {
        self.queue
            .list()
            .unwrap()
            .into_iter()
            .map(|r| r.factory_key)
            .collect()
    }
}
