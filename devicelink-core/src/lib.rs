//! Device Link Core Library
//!
//! Links a new secondary device to an existing messaging account and then
//! pulls account state (contacts, groups, block-list, configuration) from the
//! devices that are already registered. The library provides:
//! - the device-linking handshake and its single commit step
//! - a durable, constraint-gated job queue with bounded retry
//! - the sync-request jobs and the contact sync response processor

pub mod account;
pub mod config;
pub mod crypto;
pub mod database;
pub mod jobs;
pub mod linking;
pub mod platform;
pub mod recipients;
pub mod service;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use account::{AccountHandle, AccountState, DeviceIdentity};
pub use config::LinkConfig;
pub use crypto::{CryptoError, IdentityKeyPair, ProfileKey};
pub use database::Database;
pub use jobs::{Job, JobContext, JobQueue, JobRecord, JobRunner};
pub use linking::{LinkingCoordinator, LinkingEvent, LinkingState};
pub use platform::{get_config_dir, get_data_dir, get_default_database_path};

use thiserror::Error;

/// Result type for device link operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// General error type for device link operations
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Malformed data: {0}")]
    MalformedData(String),

    #[error("Untrusted identity: {0}")]
    UntrustedIdentity(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Whether the failure may go away on its own (network blips, timeouts, I/O).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_) | Self::Io(_))
    }
}

/// Errors raised by the local SQLite store
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    #[error("{0}")]
    Other(String),
}
