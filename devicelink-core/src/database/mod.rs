//! Database layer for the device link library.
//!
//! A single SQLite file holds the account state, the recipient and identity
//! stores, published prekeys and the durable job queue.

pub mod schema;

pub use schema::Database;

use crate::{DatabaseError, Result};
use std::sync::{Arc, Mutex, MutexGuard};

/// Database shared between the coordinator, the job queue and running jobs.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub fn shared(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

/// Lock the shared database, naming the caller in the poison error.
pub fn lock<'a>(db: &'a SharedDatabase, context: &str) -> Result<MutexGuard<'a, Database>> {
    db.lock()
        .map_err(|_| DatabaseError::LockPoisoned(context.to_string()).into())
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
