//! Recipient and identity stores.
//!
//! Every setter is last-write-wins on a single column, so applying the same
//! contact record twice leaves the row exactly as applying it once.

use rusqlite::{Connection, OptionalExtension};
use std::str::FromStr;

use crate::crypto::{ProfileKey, PublicIdentityKey};
use crate::database::now_millis;
use crate::{DatabaseError, LinkError, Result};

/// Avatar/conversation color assigned to a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialColor {
    Red,
    Pink,
    Purple,
    DeepPurple,
    Indigo,
    Blue,
    LightBlue,
    Cyan,
    Teal,
    Green,
    LightGreen,
    Orange,
    DeepOrange,
    Amber,
    BlueGrey,
    Grey,
    Group,
}

impl MaterialColor {
    const ALL: [MaterialColor; 17] = [
        Self::Red,
        Self::Pink,
        Self::Purple,
        Self::DeepPurple,
        Self::Indigo,
        Self::Blue,
        Self::LightBlue,
        Self::Cyan,
        Self::Teal,
        Self::Green,
        Self::LightGreen,
        Self::Orange,
        Self::DeepOrange,
        Self::Amber,
        Self::BlueGrey,
        Self::Grey,
        Self::Group,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Red => "red",
            Self::Pink => "pink",
            Self::Purple => "purple",
            Self::DeepPurple => "deep_purple",
            Self::Indigo => "indigo",
            Self::Blue => "blue",
            Self::LightBlue => "light_blue",
            Self::Cyan => "cyan",
            Self::Teal => "teal",
            Self::Green => "green",
            Self::LightGreen => "light_green",
            Self::Orange => "orange",
            Self::DeepOrange => "deep_orange",
            Self::Amber => "amber",
            Self::BlueGrey => "blue_grey",
            Self::Grey => "grey",
            Self::Group => "group_color",
        }
    }
}

impl FromStr for MaterialColor {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| LinkError::MalformedData(format!("unknown color: {}", s)))
    }
}

/// Local trust state of a remote identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifiedStatus {
    Default,
    Verified,
    Unverified,
}

impl VerifiedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Verified => "verified",
            Self::Unverified => "unverified",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "verified" => Self::Verified,
            "unverified" => Self::Unverified,
            _ => Self::Default,
        }
    }
}

/// A row of the recipient store.
#[derive(Debug, Clone, PartialEq)]
pub struct Recipient {
    pub recipient_id: i64,
    pub identifier: String,
    pub name: Option<String>,
    pub color: Option<MaterialColor>,
    pub profile_key: Option<Vec<u8>>,
    pub profile_name: Option<String>,
}

pub struct RecipientStore;

impl RecipientStore {
    /// Resolve the recipient for `identifier`, creating it if needed.
    pub fn get_or_create(conn: &Connection, identifier: &str) -> Result<i64> {
        let now = now_millis();
        conn.execute(
            "INSERT INTO recipients (identifier, created_at, modified_at) VALUES (?1, ?2, ?2)
             ON CONFLICT(identifier) DO NOTHING",
            rusqlite::params![identifier, now],
        )
        .map_err(DatabaseError::Sqlite)?;

        conn.query_row(
            "SELECT recipient_id FROM recipients WHERE identifier = ?1",
            [identifier],
            |row| row.get(0),
        )
        .map_err(|e| DatabaseError::Sqlite(e).into())
    }

    pub fn get(conn: &Connection, identifier: &str) -> Result<Option<Recipient>> {
        let row = conn
            .query_row(
                "SELECT recipient_id, identifier, name, color, profile_key, profile_name
                 FROM recipients WHERE identifier = ?1",
                [identifier],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<Vec<u8>>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        Ok(row.map(
            |(recipient_id, identifier, name, color, profile_key, profile_name)| Recipient {
                recipient_id,
                identifier,
                name,
                // A stored color always came through MaterialColor::as_str.
                color: color.and_then(|c| c.parse().ok()),
                profile_key,
                profile_name,
            },
        ))
    }

    pub fn count(conn: &Connection) -> Result<i64> {
        conn.query_row("SELECT COUNT(*) FROM recipients", [], |row| row.get(0))
            .map_err(|e| DatabaseError::Sqlite(e).into())
    }

    pub fn set_profile_key(conn: &Connection, recipient_id: i64, key: &ProfileKey) -> Result<()> {
        Self::update(
            conn,
            "UPDATE recipients SET profile_key = ?1, modified_at = ?2 WHERE recipient_id = ?3",
            rusqlite::params![key.as_bytes().to_vec(), now_millis(), recipient_id],
        )
    }

    pub fn set_color(conn: &Connection, recipient_id: i64, color: MaterialColor) -> Result<()> {
        Self::update(
            conn,
            "UPDATE recipients SET color = ?1, modified_at = ?2 WHERE recipient_id = ?3",
            rusqlite::params![color.as_str(), now_millis(), recipient_id],
        )
    }

    pub fn set_name(conn: &Connection, recipient_id: i64, name: &str) -> Result<()> {
        Self::update(
            conn,
            "UPDATE recipients SET name = ?1, modified_at = ?2 WHERE recipient_id = ?3",
            rusqlite::params![name, now_millis(), recipient_id],
        )
    }

    pub fn set_profile_name(conn: &Connection, recipient_id: i64, name: Option<&str>) -> Result<()> {
        Self::update(
            conn,
            "UPDATE recipients SET profile_name = ?1, modified_at = ?2 WHERE recipient_id = ?3",
            rusqlite::params![name, now_millis(), recipient_id],
        )
    }

    fn update(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let changed = conn.execute(sql, params).map_err(DatabaseError::Sqlite)?;
        if changed == 0 {
            return Err(LinkError::NotFound("recipient".to_string()));
        }
        Ok(())
    }
}

/// A stored remote identity key and its trust state.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub identifier: String,
    pub identity_key: PublicIdentityKey,
    pub verified_status: VerifiedStatus,
    pub first_use: bool,
    pub nonblocking_approval: bool,
}

pub struct IdentityStore;

impl IdentityStore {
    pub fn save_identity(
        conn: &Connection,
        identifier: &str,
        identity_key: &PublicIdentityKey,
        status: VerifiedStatus,
        first_use: bool,
        timestamp: i64,
        nonblocking_approval: bool,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO identities (identifier, identity_key, verified_status, first_use,
                                     timestamp, nonblocking_approval)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(identifier) DO UPDATE SET
                identity_key = excluded.identity_key,
                verified_status = excluded.verified_status,
                first_use = excluded.first_use,
                timestamp = excluded.timestamp,
                nonblocking_approval = excluded.nonblocking_approval",
            rusqlite::params![
                identifier,
                identity_key.as_bytes().to_vec(),
                status.as_str(),
                first_use,
                timestamp,
                nonblocking_approval,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    pub fn get_identity(conn: &Connection, identifier: &str) -> Result<Option<IdentityRecord>> {
        let row = conn
            .query_row(
                "SELECT identity_key, verified_status, first_use, nonblocking_approval
                 FROM identities WHERE identifier = ?1",
                [identifier],
                |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        row.map(|(key, status, first_use, nonblocking_approval)| {
            Ok(IdentityRecord {
                identifier: identifier.to_string(),
                identity_key: PublicIdentityKey::from_bytes(&key)?,
                verified_status: VerifiedStatus::parse(&status),
                first_use,
                nonblocking_approval,
            })
        })
        .transpose()
    }
}
