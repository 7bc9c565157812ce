//! Persisted job rows and their parameter maps.

use rusqlite::Row;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::jobs::Job;
use crate::{DatabaseError, LinkError, Result};

/// Precondition a job needs before it may be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Network,
}

/// Opaque key/value parameters, interpreted only by the job's factory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobData(BTreeMap<String, String>);

impl JobData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_string(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn put_u64(self, key: &str, value: u64) -> Self {
        self.put_string(key, value.to_string())
    }

    pub fn get_string(&self, key: &str) -> Result<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| LinkError::MalformedData(format!("missing job parameter '{}'", key)))
    }

    pub fn get_u64(&self, key: &str) -> Result<u64> {
        let raw = self.get_string(key)?;
        raw.parse()
            .map_err(|_| LinkError::MalformedData(format!("job parameter '{}' is not a number", key)))
    }

    pub fn get_u32(&self, key: &str) -> Result<u32> {
        u32::try_from(self.get_u64(key)?)
            .map_err(|_| LinkError::MalformedData(format!("job parameter '{}' out of range", key)))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| DatabaseError::Serialization(e.to_string()).into())
    }

    pub(crate) fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| DatabaseError::Serialization(e.to_string()).into())
    }
}

/// A queued job as stored in the `jobs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: String,
    pub factory_key: String,
    pub parameters: JobData,
    pub constraints: Vec<ConstraintKind>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub created_at: i64,
    /// Unix millis before which the record is not eligible.
    pub next_run_at: i64,
}

impl JobRecord {
    pub(crate) const COLUMNS: &'static str = "job_id, factory_key, parameters, constraints, \
         attempt_count, max_attempts, created_at, next_run_at";

    pub fn requires_network(&self) -> bool {
        self.constraints.contains(&ConstraintKind::Network)
    }

    /// Rebuild the job this record was created from.
    pub fn job(&self) -> Result<Job> {
        Job::deserialize(&self.factory_key, &self.parameters)
    }

    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<RawJobRow> {
        Ok(RawJobRow {
            id: row.get(0)?,
            factory_key: row.get(1)?,
            parameters: row.get(2)?,
            constraints: row.get(3)?,
            attempt_count: row.get(4)?,
            max_attempts: row.get(5)?,
            created_at: row.get(6)?,
            next_run_at: row.get(7)?,
        })
    }
}

/// Row as read from SQLite, before the JSON columns are decoded.
pub(crate) struct RawJobRow {
    id: String,
    factory_key: String,
    parameters: String,
    constraints: String,
    attempt_count: u32,
    max_attempts: u32,
    created_at: i64,
    next_run_at: i64,
}

impl RawJobRow {
    pub(crate) fn decode(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: self.id,
            factory_key: self.factory_key,
            parameters: JobData::from_json(&self.parameters)?,
            constraints: serde_json::from_str(&self.constraints)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            next_run_at: self.next_run_at,
        })
    }
}
