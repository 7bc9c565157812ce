//! Fetch a recipient's profile and store the profile name.

use tracing::debug;

use crate::crypto::ProfileKey;
use crate::database::lock;
use crate::jobs::{ConstraintKind, JobContext, JobData};
use crate::recipients::RecipientStore;
use crate::{DatabaseError, LinkError, Result};

pub const KEY: &str = "RetrieveProfileJob";

const IDENTIFIER: &str = "identifier";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveProfileJob {
    pub identifier: String,
}

impl RetrieveProfileJob {
    pub const MAX_ATTEMPTS: u32 = 5;

    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    pub fn constraints(&self) -> Vec<ConstraintKind> {
        vec![ConstraintKind::Network]
    }

    pub fn serialize(&self) -> JobData {
        JobData::new().put_string(IDENTIFIER, self.identifier.as_str())
    }

    pub fn deserialize(data: &JobData) -> Result<Self> {
        Ok(Self::new(data.get_string(IDENTIFIER)?))
    }

    pub async fn run(&self, ctx: &JobContext) -> Result<()> {
        let profile_key = self.profile_key(ctx)?;
        let profile = ctx
            .profiles
            .retrieve_profile(&self.identifier, profile_key.as_ref())
            .await?;

        let db = lock(&ctx.db, "store profile")?;
        let tx = db
            .conn()
            .unchecked_transaction()
            .map_err(DatabaseError::Sqlite)?;
        let recipient_id = RecipientStore::get_or_create(&tx, &self.identifier)?;
        RecipientStore::set_profile_name(&tx, recipient_id, profile.name.as_deref())?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        debug!("Stored profile for {}", self.identifier);
        Ok(())
    }

    /// Stored profile key for the recipient, falling back to the account key for self.
    fn profile_key(&self, ctx: &JobContext) -> Result<Option<ProfileKey>> {
        if ctx.account.local_identifier().as_deref() == Some(self.identifier.as_str()) {
            return Ok(ctx.account.profile_key());
        }
        let db = lock(&ctx.db, "read profile key")?;
        RecipientStore::get(db.conn(), &self.identifier)?
            .and_then(|r| r.profile_key)
            .map(|k| ProfileKey::from_bytes(&k).map_err(LinkError::from))
            .transpose()
    }

    pub fn should_retry(&self, error: &LinkError) -> bool {
        error.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_roundtrip() {
        let job = RetrieveProfileJob::new("+15550004444");
        assert_eq!(RetrieveProfileJob::deserialize(&job.serialize()).unwrap(), job);
    }

    #[test]
    fn retries_only_transient_errors() {
        let job = RetrieveProfileJob::new("+1555");
        assert!(job.should_retry(&LinkError::Network("reset".into())));
        assert!(!job.should_retry(&LinkError::MalformedData("bad".into())));
        assert!(!job.should_retry(&LinkError::NotFound("profile".into())));
    }
}
