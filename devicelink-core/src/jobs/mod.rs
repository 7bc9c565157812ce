//! Durable job queue and the jobs it runs.
//!
//! Jobs are a closed set of variants. Each variant is persisted under a
//! factory key and rebuilt through [`FACTORIES`] when the queue loads it.

pub mod queue;
pub mod record;
pub mod retrieve_profile;
pub mod runner;
pub mod sync_request;
pub mod update_contact;


pub use queue::{CancelOutcome, Completion, JobQueue};
pub use record::{ConstraintKind, JobData, JobRecord};
pub use retrieve_profile::RetrieveProfileJob;
pub use runner::{JobContext, JobRunner};
pub use sync_request::SyncRequestJob;
pub use update_contact::UpdateContactJob;

use tracing::info;

use crate::sync::SyncRequestType;
use crate::{LinkError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    SyncRequest(SyncRequestJob),
    UpdateContact(UpdateContactJob),
    RetrieveProfile(RetrieveProfileJob),
}

type Factory = fn(&JobData) -> Result<Job>;

/// Factory key to constructor, used when rebuilding persisted records.
pub const FACTORIES: [(&str, Factory); 6] = [
    (sync_request::CONTACTS_KEY, |_| {
        Ok(Job::SyncRequest(SyncRequestJob::new(SyncRequestType::Contacts)))
    }),
    (sync_request::GROUPS_KEY, |_| {
        Ok(Job::SyncRequest(SyncRequestJob::new(SyncRequestType::Groups)))
    }),
    (sync_request::BLOCKED_KEY, |_| {
        Ok(Job::SyncRequest(SyncRequestJob::new(SyncRequestType::Blocked)))
    }),
    (sync_request::CONFIGURATION_KEY, |_| {
        Ok(Job::SyncRequest(SyncRequestJob::new(
            SyncRequestType::Configuration,
        )))
    }),
    (update_contact::KEY, |data| {
        UpdateContactJob::deserialize(data).map(Job::UpdateContact)
    }),
    (retrieve_profile::KEY, |data| {
        RetrieveProfileJob::deserialize(data).map(Job::RetrieveProfile)
    }),
];

impl Job {
    pub fn factory_key(&self) -> &'static str {
        match self {
            Self::SyncRequest(job) => job.factory_key(),
            Self::UpdateContact(_) => update_contact::KEY,
            Self::RetrieveProfile(_) => retrieve_profile::KEY,
        }
    }

    pub fn serialize(&self) -> JobData {
        match self {
            Self::SyncRequest(job) => job.serialize(),
            Self::UpdateContact(job) => job.serialize(),
            Self::RetrieveProfile(job) => job.serialize(),
        }
    }

    pub fn deserialize(factory_key: &str, data: &JobData) -> Result<Self> {
        let (_, factory) = FACTORIES
            .iter()
            .find(|(key, _)| *key == factory_key)
            .ok_or_else(|| LinkError::MalformedData(format!("unknown job type '{}'", factory_key)))?;
        factory(data)
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::SyncRequest(_) => SyncRequestJob::MAX_ATTEMPTS,
            Self::UpdateContact(_) => UpdateContactJob::MAX_ATTEMPTS,
            Self::RetrieveProfile(_) => RetrieveProfileJob::MAX_ATTEMPTS,
        }
    }

    pub fn constraints(&self) -> Vec<ConstraintKind> {
        match self {
            Self::SyncRequest(job) => job.constraints(),
            Self::UpdateContact(job) => job.constraints(),
            Self::RetrieveProfile(job) => job.constraints(),
        }
    }

    pub async fn run(&self, ctx: &JobContext) -> Result<()> {
        match self {
            Self::SyncRequest(job) => job.run(ctx).await,
            Self::UpdateContact(job) => job.run(ctx).await,
            Self::RetrieveProfile(job) => job.run(ctx).await,
        }
    }

    pub fn should_retry(&self, error: &LinkError) -> bool {
        match self {
            Self::SyncRequest(job) => job.should_retry(error),
            Self::UpdateContact(job) => job.should_retry(error),
            Self::RetrieveProfile(job) => job.should_retry(error),
        }
    }

    /// Runs when the record is removed before the job succeeded.
    pub fn on_canceled(&self) {
        info!("{} canceled", self.factory_key());
    }
}
