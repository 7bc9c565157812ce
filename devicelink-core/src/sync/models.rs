//! Sync request messages sent to the account's other devices.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of account state another device is asked to resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRequestType {
    Contacts,
    Groups,
    Blocked,
    Configuration,
}

impl SyncRequestType {
    pub const ALL: [SyncRequestType; 4] = [
        Self::Contacts,
        Self::Groups,
        Self::Blocked,
        Self::Configuration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contacts => "contacts",
            Self::Groups => "groups",
            Self::Blocked => "blocked",
            Self::Configuration => "configuration",
        }
    }
}

impl fmt::Display for SyncRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request envelope. Built, sent and dropped; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequestEnvelope {
    pub request_type: SyncRequestType,
}

impl SyncRequestEnvelope {
    pub fn new(request_type: SyncRequestType) -> Self {
        Self { request_type }
    }
}
