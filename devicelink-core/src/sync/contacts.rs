//! Device contact stream delivered in response to a contacts sync request.
//!
//! The stream is a concatenation of varint length-prefixed `ContactDetails`
//! records. A record that carries an avatar is followed by exactly
//! `avatar.length` raw bytes, and those bytes have no framing of their own:
//! the reader has to consume them before the next length prefix.

use std::io::{ErrorKind, Read, Write};

use prost::Message;

use crate::crypto::{ProfileKey, PublicIdentityKey};
use crate::recipients::VerifiedStatus;
use crate::{LinkError, Result};

/// A varint never needs more than 10 bytes.
const MAX_VARINT_LEN: usize = 10;

/// Upper bound on one encoded `ContactDetails` record, avatar excluded.
pub const MAX_RECORD_LEN: usize = 256 * 1024;

#[derive(Clone, PartialEq, Message)]
pub struct ContactDetails {
    #[prost(string, optional, tag = "1")]
    pub number: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(message, optional, tag = "3")]
    pub avatar: Option<AvatarDetails>,
    #[prost(string, optional, tag = "4")]
    pub color: Option<String>,
    #[prost(message, optional, tag = "5")]
    pub verified: Option<VerifiedDetails>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub profile_key: Option<Vec<u8>>,
    #[prost(bool, optional, tag = "7")]
    pub blocked: Option<bool>,
    #[prost(uint32, optional, tag = "8")]
    pub expire_timer: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AvatarDetails {
    #[prost(string, optional, tag = "1")]
    pub content_type: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub length: Option<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VerifiedDetails {
    #[prost(string, optional, tag = "1")]
    pub destination: Option<String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub identity_key: Option<Vec<u8>>,
    #[prost(enumeration = "VerifiedState", optional, tag = "3")]
    pub state: Option<i32>,
}

/// Verification state as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum VerifiedState {
    Default = 0,
    Verified = 1,
    Unverified = 2,
}

impl From<VerifiedState> for VerifiedStatus {
    fn from(state: VerifiedState) -> Self {
        match state {
            VerifiedState::Default => VerifiedStatus::Default,
            VerifiedState::Verified => VerifiedStatus::Verified,
            VerifiedState::Unverified => VerifiedStatus::Unverified,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedIdentity {
    pub identity_key: PublicIdentityKey,
    pub state: VerifiedState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactAvatar {
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// One decoded contact. Consumed immediately by the response processor.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceContact {
    pub identifier: String,
    pub name: Option<String>,
    pub color: Option<String>,
    pub profile_key: Option<ProfileKey>,
    pub verified: Option<VerifiedIdentity>,
    pub avatar: Option<ContactAvatar>,
    pub blocked: bool,
    pub expire_timer: Option<u32>,
}

impl DeviceContact {
    fn from_details(details: ContactDetails, avatar: Option<ContactAvatar>) -> Result<Self> {
        let identifier = details
            .number
            .filter(|n| !n.is_empty())
            .ok_or_else(|| LinkError::MalformedData("contact without number".to_string()))?;

        let profile_key = details
            .profile_key
            .map(|k| ProfileKey::from_bytes(&k))
            .transpose()
            .map_err(|e| LinkError::MalformedData(format!("contact profile key: {}", e)))?;

        let verified = match details.verified {
            Some(v) => {
                let key = v.identity_key.ok_or_else(|| {
                    LinkError::MalformedData("verified record without identity key".to_string())
                })?;
                let identity_key = PublicIdentityKey::from_bytes(&key)
                    .map_err(|e| LinkError::MalformedData(format!("contact identity: {}", e)))?;
                let state = VerifiedState::try_from(v.state.unwrap_or_default()).map_err(|_| {
                    LinkError::MalformedData(format!("unknown verified state {:?}", v.state))
                })?;
                Some(VerifiedIdentity {
                    identity_key,
                    state,
                })
            }
            None => None,
        };

        Ok(Self {
            identifier,
            name: details.name,
            color: details.color,
            profile_key,
            verified,
            avatar,
            blocked: details.blocked.unwrap_or(false),
            expire_timer: details.expire_timer,
        })
    }
}

/// Sequential reader over a device contact stream.
///
/// Lengths come from the sender and are never trusted: a record or avatar
/// that claims more bytes than the stream may still hold is malformed.
pub struct DeviceContactsReader<R: Read> {
    inner: R,
    /// Bytes the stream may still contain.
    remaining: u64,
}

impl<R: Read> DeviceContactsReader<R> {
    /// Reader over at most `size_limit` bytes of `inner`.
    pub fn new(inner: R, size_limit: u64) -> Self {
        Self {
            inner,
            remaining: size_limit,
        }
    }

    /// Read the next contact, or `None` at a clean end of stream.
    pub fn read_next(&mut self) -> Result<Option<DeviceContact>> {
        let Some(len) = self.read_length()? else {
            return Ok(None);
        };
        if len > MAX_RECORD_LEN {
            return Err(LinkError::MalformedData(format!(
                "contact record of {} bytes exceeds {}",
                len, MAX_RECORD_LEN
            )));
        }

        let record = self.read_exactly(len as u64, "contact record")?;
        let details = ContactDetails::decode(record.as_slice())
            .map_err(|e| LinkError::MalformedData(format!("contact record: {}", e)))?;

        let avatar = match &details.avatar {
            Some(avatar) => {
                let len = u64::from(avatar.length.unwrap_or(0));
                let data = self.read_exactly(len, "contact avatar")?;
                Some(ContactAvatar {
                    content_type: avatar.content_type.clone(),
                    data,
                })
            }
            None => None,
        };

        DeviceContact::from_details(details, avatar).map(Some)
    }

    pub fn read_all(mut self) -> Result<Vec<DeviceContact>> {
        let mut contacts = Vec::new();
        while let Some(contact) = self.read_next()? {
            contacts.push(contact);
        }
        Ok(contacts)
    }

    fn read_length(&mut self) -> Result<Option<usize>> {
        let mut varint = Vec::with_capacity(MAX_VARINT_LEN);
        loop {
            let mut byte = [0u8; 1];
            match self.inner.read(&mut byte) {
                Ok(0) if varint.is_empty() => return Ok(None),
                Ok(0) => {
                    return Err(LinkError::MalformedData(
                        "stream ended inside a length prefix".to_string(),
                    ))
                }
                Ok(_) => varint.push(byte[0]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            if byte[0] & 0x80 == 0 {
                break;
            }
            if varint.len() == MAX_VARINT_LEN {
                return Err(LinkError::MalformedData("length prefix too long".to_string()));
            }
        }

        self.remaining = self.remaining.saturating_sub(varint.len() as u64);
        prost::decode_length_delimiter(varint.as_slice())
            .map(Some)
            .map_err(|e| LinkError::MalformedData(format!("length prefix: {}", e)))
    }

    /// Read exactly `len` bytes. The buffer only grows with bytes actually
    /// read, so a lying length cannot force a large allocation.
    fn read_exactly(&mut self, len: u64, what: &str) -> Result<Vec<u8>> {
        if len > self.remaining {
            return Err(LinkError::MalformedData(format!(
                "{} of {} bytes exceeds the {} bytes left in the stream",
                what, len, self.remaining
            )));
        }

        let mut buf = Vec::new();
        (&mut self.inner).take(len).read_to_end(&mut buf)?;
        if (buf.len() as u64) < len {
            return Err(LinkError::MalformedData(format!("truncated {}", what)));
        }
        self.remaining -= len;
        Ok(buf)
    }
}

/// Writer producing the stream [`DeviceContactsReader`] consumes.
pub struct DeviceContactsWriter<W: Write> {
    inner: W,
}

impl<W: Write> DeviceContactsWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one record. The avatar length in `details` is set from `avatar`.
    pub fn write(&mut self, mut details: ContactDetails, avatar: Option<&ContactAvatar>) -> Result<()> {
        details.avatar = avatar.map(|a| AvatarDetails {
            content_type: a.content_type.clone(),
            length: Some(a.data.len() as u32),
        });
        self.inner.write_all(&details.encode_length_delimited_to_vec())?;
        if let Some(avatar) = avatar {
            self.inner.write_all(&avatar.data)?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
