//! Apply a device contact stream received in reply to a contacts sync request.

use base64::{engine::general_purpose::STANDARD, Engine};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::crypto::ProfileKey;
use crate::database::{lock, now_millis};
use crate::jobs::{ConstraintKind, Job, JobContext, JobData, JobQueue, RetrieveProfileJob};
use crate::recipients::{IdentityStore, MaterialColor, RecipientStore};
use crate::service::AttachmentPointer;
use crate::sync::{DeviceContact, DeviceContactsReader};
use crate::{DatabaseError, LinkError, Result};

pub const KEY: &str = "UpdateContactJob";

const POINTER_ID: &str = "pointer_id";
const POINTER_CONTENT_TYPE: &str = "pointer_content_type";
const POINTER_KEY: &str = "pointer_key";
const POINTER_SIZE: &str = "pointer_size";
const POINTER_DIGEST: &str = "pointer_digest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateContactJob {
    pub pointer: AttachmentPointer,
}

impl UpdateContactJob {
    pub const MAX_ATTEMPTS: u32 = 10;

    pub fn new(pointer: AttachmentPointer) -> Self {
        Self { pointer }
    }

    pub fn constraints(&self) -> Vec<ConstraintKind> {
        vec![ConstraintKind::Network]
    }

    pub fn serialize(&self) -> JobData {
        JobData::new()
            .put_u64(POINTER_ID, self.pointer.id)
            .put_string(POINTER_CONTENT_TYPE, self.pointer.content_type.as_str())
            .put_string(POINTER_KEY, STANDARD.encode(&self.pointer.key))
            .put_u64(POINTER_SIZE, u64::from(self.pointer.size))
            .put_string(POINTER_DIGEST, STANDARD.encode(&self.pointer.digest))
    }

    pub fn deserialize(data: &JobData) -> Result<Self> {
        let decode = |key: &str| -> Result<Vec<u8>> {
            STANDARD
                .decode(data.get_string(key)?)
                .map_err(|e| LinkError::MalformedData(format!("job parameter '{}': {}", key, e)))
        };

        Ok(Self::new(AttachmentPointer {
            id: data.get_u64(POINTER_ID)?,
            content_type: data.get_string(POINTER_CONTENT_TYPE)?.to_string(),
            key: decode(POINTER_KEY)?,
            size: data.get_u32(POINTER_SIZE)?,
            digest: decode(POINTER_DIGEST)?,
        }))
    }

    pub async fn run(&self, ctx: &JobContext) -> Result<()> {
        let local = ctx
            .account
            .local_identifier()
            .ok_or_else(|| LinkError::NotFound("account is not linked".to_string()))?;

        std::fs::create_dir_all(&ctx.config.cache_dir)?;
        let download = tempfile::Builder::new()
            .prefix("contact")
            .suffix(".tmp")
            .tempfile_in(&ctx.config.cache_dir)?;

        let stream = ctx
            .transport
            .retrieve_attachment(&self.pointer, download.path(), ctx.config.attachment_size_limit)
            .await?;
        // Decoding reads the download synchronously; keep it off the runtime.
        let size_limit = ctx.config.attachment_size_limit;
        let contacts = tokio::task::spawn_blocking(move || {
            DeviceContactsReader::new(stream, size_limit).read_all()
        })
        .await
        .map_err(|e| LinkError::MalformedData(format!("contact decode task: {}", e)))??;
        info!("Received {} contacts from linked device", contacts.len());

        let refresh = {
            let db = lock(&ctx.db, "apply contacts")?;
            let tx = db
                .conn()
                .unchecked_transaction()
                .map_err(DatabaseError::Sqlite)?;
            let refresh = apply_contacts(&tx, &local, ctx.account.profile_key().as_ref(), &contacts)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
            refresh
        };
        ctx.queue.notify();

        for identifier in refresh {
            match ctx.directory.refresh(&identifier).await {
                Ok(registered) => debug!("Directory refresh for {}: {}", identifier, registered),
                Err(e) => warn!("Directory refresh for {} failed: {}", identifier, e),
            }
        }
        Ok(())
    }

    pub fn should_retry(&self, error: &LinkError) -> bool {
        error.is_transient()
    }
}

/// Reconcile decoded contacts into the recipient and identity stores and
/// enqueue a profile retrieval for each. Returns the non-self identifiers
/// whose directory entry should be refreshed.
///
/// Every write is last-write-wins, so applying the same contacts again
/// leaves the stores unchanged.
pub(crate) fn apply_contacts(
    conn: &Connection,
    local_identifier: &str,
    local_profile_key: Option<&ProfileKey>,
    contacts: &[DeviceContact],
) -> Result<Vec<String>> {
    let mut refresh = Vec::new();

    for contact in contacts {
        if contact.identifier == local_identifier {
            if let Some(key) = local_profile_key {
                let recipient_id = RecipientStore::get_or_create(conn, local_identifier)?;
                RecipientStore::set_profile_key(conn, recipient_id, key)?;
            }
            JobQueue::insert_record(
                conn,
                &Job::RetrieveProfile(RetrieveProfileJob::new(local_identifier)),
            )?;
            continue;
        }

        let recipient_id = RecipientStore::get_or_create(conn, &contact.identifier)?;

        if let Some(key) = &contact.profile_key {
            RecipientStore::set_profile_key(conn, recipient_id, key)?;
        }

        if let Some(color) = &contact.color {
            match color.parse::<MaterialColor>() {
                Ok(color) => RecipientStore::set_color(conn, recipient_id, color)?,
                Err(e) => warn!("Skipping color for {}: {}", contact.identifier, e),
            }
        }

        if let Some(name) = &contact.name {
            RecipientStore::set_name(conn, recipient_id, name)?;
        }

        if let Some(verified) = &contact.verified {
            IdentityStore::save_identity(
                conn,
                &contact.identifier,
                &verified.identity_key,
                verified.state.into(),
                true,
                now_millis(),
                true,
            )?;
        }

        JobQueue::insert_record(
            conn,
            &Job::RetrieveProfile(RetrieveProfileJob::new(contact.identifier.as_str())),
        )?;
        refresh.push(contact.identifier.clone());
    }

    Ok(refresh)
}
