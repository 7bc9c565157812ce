//! Sync protocol messages: outbound requests and the inbound contact stream.

pub mod contacts;
pub mod models;

pub use contacts::{
    ContactAvatar, DeviceContact, DeviceContactsReader, DeviceContactsWriter, VerifiedIdentity,
    VerifiedState,
};
pub use models::{SyncRequestEnvelope, SyncRequestType};
