//! Jobs asking the account's other devices to resend a category of state.

use tracing::{info, warn};

use crate::jobs::{ConstraintKind, JobContext, JobData};
use crate::sync::{SyncRequestEnvelope, SyncRequestType};
use crate::{LinkError, Result};

pub const CONTACTS_KEY: &str = "ContactSyncRequestJob";
pub const GROUPS_KEY: &str = "GroupSyncRequestJob";
pub const BLOCKED_KEY: &str = "BlockedSyncRequestJob";
pub const CONFIGURATION_KEY: &str = "ConfigurationSyncRequestJob";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequestJob {
    pub request_type: SyncRequestType,
}

impl SyncRequestJob {
    pub const MAX_ATTEMPTS: u32 = 1;

    pub fn new(request_type: SyncRequestType) -> Self {
        Self { request_type }
    }

    /// One job per request type, in the order they are enqueued after linking.
    pub fn all() -> impl Iterator<Item = Self> {
        SyncRequestType::ALL.into_iter().map(Self::new)
    }

    pub fn factory_key(&self) -> &'static str {
        match self.request_type {
            SyncRequestType::Contacts => CONTACTS_KEY,
            SyncRequestType::Groups => GROUPS_KEY,
            SyncRequestType::Blocked => BLOCKED_KEY,
            SyncRequestType::Configuration => CONFIGURATION_KEY,
        }
    }

    pub fn constraints(&self) -> Vec<ConstraintKind> {
        vec![ConstraintKind::Network]
    }

    /// The request type is carried by the factory key; there are no parameters.
    pub fn serialize(&self) -> JobData {
        JobData::new()
    }

    pub fn envelope(&self) -> SyncRequestEnvelope {
        SyncRequestEnvelope::new(self.request_type)
    }

    /// Transmit the request. A failed send is logged and treated as done.
    pub async fn run(&self, ctx: &JobContext) -> Result<()> {
        match ctx.transport.send(self.envelope(), None).await {
            Ok(()) => info!("Sent {} sync request", self.request_type),
            Err(e) => warn!("{} sync request not sent: {}", self.request_type, e),
        }
        Ok(())
    }

    pub fn should_retry(&self, _error: &LinkError) -> bool {
        false
    }
}
