//! Collaborators the library talks to but does not implement itself.
//!
//! Account management has an HTTP client in [`http`]. Message transport,
//! directory and profile lookups are provided by the embedding application.

pub mod http;

pub use http::HttpAccountManager;

use async_trait::async_trait;
use std::io::Read;
use std::path::Path;

use crate::crypto::{IdentityKeyPair, OneTimePreKey, ProfileKey, PublicIdentityKey, SignedPreKey};
use crate::sync::SyncRequestEnvelope;
use crate::Result;

/// Basic-auth credentials for authenticated account-management calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Credentials of a linked device: `<account>.<device>` plus its password.
    pub fn for_device(account_id: &str, device_id: u32, password: &str) -> Self {
        Self {
            username: format!("{}.{}", account_id, device_id),
            password: password.to_string(),
        }
    }
}

/// What the new device tells the endpoint when it waits for the primary.
#[derive(Debug, Clone)]
pub struct LinkCompletionRequest {
    pub provisioning_handle: String,
    pub ephemeral_public_key: PublicIdentityKey,
    pub password: String,
    pub signaling_key: String,
    pub registration_id: u32,
    pub device_name: String,
}

/// Permanent material returned once the primary device confirmed the link.
#[derive(Debug, Clone)]
pub struct NewDeviceRegistration {
    pub device_id: u32,
    pub account_id: String,
    pub identity_key_pair: IdentityKeyPair,
    pub profile_key: ProfileKey,
}

/// Reference to an attachment held by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPointer {
    pub id: u64,
    pub content_type: String,
    pub key: Vec<u8>,
    pub size: u32,
    pub digest: Vec<u8>,
}

/// Subset of a remote profile the library stores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub name: Option<String>,
}

#[async_trait]
pub trait AccountManager: Send + Sync {
    async fn request_provisioning_handle(&self, password: &str) -> Result<String>;

    /// Long-lived; returns once the primary device confirms out of band.
    async fn await_link_completion(
        &self,
        request: &LinkCompletionRequest,
    ) -> Result<NewDeviceRegistration>;

    /// `None` registers the device without push delivery.
    async fn register_push_token(&self, credentials: &Credentials, token: Option<&str>)
        -> Result<()>;

    async fn upload_pre_keys(
        &self,
        credentials: &Credentials,
        identity_key: &PublicIdentityKey,
        signed_pre_key: &SignedPreKey,
        one_time_pre_keys: &[OneTimePreKey],
    ) -> Result<()>;

    async fn sender_certificate(&self, credentials: &Credentials) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// `target = None` addresses the account's own devices without pinning
    /// any recipient identity.
    async fn send(
        &self,
        envelope: SyncRequestEnvelope,
        target: Option<&PublicIdentityKey>,
    ) -> Result<()>;

    /// Download the attachment into `destination` and return a reader over
    /// its decrypted content.
    async fn retrieve_attachment(
        &self,
        pointer: &AttachmentPointer,
        destination: &Path,
        size_limit: u64,
    ) -> Result<Box<dyn Read + Send>>;
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Re-check whether `identifier` is a registered account.
    async fn refresh(&self, identifier: &str) -> Result<bool>;
}

#[async_trait]
pub trait ProfileService: Send + Sync {
    async fn retrieve_profile(
        &self,
        identifier: &str,
        profile_key: Option<&ProfileKey>,
    ) -> Result<Profile>;
}

#[async_trait]
pub trait PushTokenSource: Send + Sync {
    async fn token(&self) -> Result<Option<String>>;
}

/// Push source for hosts without a push service.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPushToken;

#[async_trait]
impl PushTokenSource for NoPushToken {
    async fn token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}
