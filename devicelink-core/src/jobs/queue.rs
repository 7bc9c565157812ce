//! SQLite-backed job queue.
//!
//! Records are claimed in enqueue order. A record is eligible once its
//! backoff has elapsed, its constraints hold and no other record with the same
//! factory key is running, which keeps each factory key strictly FIFO and at
//! most one in flight.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{params, Connection};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LinkConfig;
use crate::database::{lock, now_millis, SharedDatabase};
use crate::jobs::{Job, JobRecord};
use crate::{DatabaseError, LinkError, Result};

/// What happened to a record after its run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Succeeded and removed.
    Done,
    /// Kept; eligible again at the given unix millis.
    Retry { next_run_at: i64 },
    /// Failed terminally and removed.
    Dropped,
    /// Removed because a cancel arrived while it was running.
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// The job is running; it is removed once the run ends.
    Deferred,
}

#[derive(Default)]
struct Dispatch {
    /// job id -> factory key of every record currently running.
    running: HashMap<String, String>,
    cancel_requested: HashSet<String>,
}

struct QueueInner {
    db: SharedDatabase,
    config: LinkConfig,
    dispatch: Mutex<Dispatch>,
    network: watch::Sender<bool>,
    wakeup: Notify,
}

/// Handle to the durable queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Open the queue over `db`, dropping records left exhausted by a crash.
    pub fn new(db: SharedDatabase, config: &LinkConfig) -> Result<Self> {
        let (network, _) = watch::channel(false);
        let queue = Self {
            inner: Arc::new(QueueInner {
                db,
                config: config.clone(),
                dispatch: Mutex::new(Dispatch::default()),
                network,
                wakeup: Notify::new(),
            }),
        };
        queue.drop_exhausted()?;
        Ok(queue)
    }

    /// Persist `job`. The record is durable when this returns.
    pub fn enqueue(&self, job: &Job) -> Result<String> {
        let id = {
            let db = lock(&self.inner.db, "enqueue job")?;
            Self::insert_record(db.conn(), job)?
        };
        debug!("Enqueued {} ({})", job.factory_key(), id);
        self.notify();
        Ok(id)
    }

    /// Insert a record on `conn`, which may be inside an open transaction.
    /// Call [`JobQueue::notify`] after the transaction commits.
    pub fn insert_record(conn: &Connection, job: &Job) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let constraints = serde_json::to_string(&job.constraints())
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO jobs (job_id, factory_key, parameters, constraints, attempt_count,
                               max_attempts, created_at, next_run_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, 0)",
            params![
                id,
                job.factory_key(),
                job.serialize().to_json()?,
                constraints,
                job.max_attempts(),
                now_millis(),
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(id)
    }

    /// Wake idle workers.
    pub fn notify(&self) {
        self.inner.wakeup.notify_waiters();
    }

    pub(crate) fn wakeup(&self) -> &Notify {
        &self.inner.wakeup
    }

    pub fn set_network_available(&self, available: bool) {
        let previous = self.inner.network.send_replace(available);
        if available && !previous {
            info!("Network available, releasing queued jobs");
            self.notify();
        }
    }

    pub fn network_available(&self) -> bool {
        *self.inner.network.borrow()
    }

    pub fn subscribe_network(&self) -> watch::Receiver<bool> {
        self.inner.network.subscribe()
    }

    fn dispatch(&self) -> Result<MutexGuard<'_, Dispatch>> {
        self.inner
            .dispatch
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("job dispatch".to_string()).into())
    }

    /// All records in enqueue order.
    pub fn list(&self) -> Result<Vec<JobRecord>> {
        let db = lock(&self.inner.db, "list jobs")?;
        Self::load(db.conn(), "", params![])
    }

    pub fn len(&self) -> Result<usize> {
        let db = lock(&self.inner.db, "count jobs")?;
        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))
            .map_err(DatabaseError::Sqlite)?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn load(
        conn: &Connection,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<JobRecord>> {
        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY seq ASC",
            JobRecord::COLUMNS,
            filter
        );
        let mut stmt = conn.prepare(&sql).map_err(DatabaseError::Sqlite)?;
        let rows = stmt
            .query_map(args, JobRecord::from_row)
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        rows.into_iter().map(|row| row.decode()).collect()
    }

    /// Claim the next eligible record and count the attempt against it.
    pub fn claim_next(&self) -> Result<Option<JobRecord>> {
        let network = self.network_available();
        let db = lock(&self.inner.db, "claim job")?;
        let mut dispatch = self.dispatch()?;

        let candidates = Self::load(
            db.conn(),
            "WHERE attempt_count < max_attempts AND next_run_at <= ?1",
            params![now_millis()],
        )?;

        let mut blocked_keys: HashSet<String> = dispatch.running.values().cloned().collect();
        for mut record in candidates {
            if dispatch.running.contains_key(&record.id) || blocked_keys.contains(&record.factory_key) {
                continue;
            }
            if record.requires_network() && !network {
                // An older record of this key waits, so younger ones wait too.
                blocked_keys.insert(record.factory_key.clone());
                continue;
            }

            db.conn()
                .execute(
                    "UPDATE jobs SET attempt_count = attempt_count + 1 WHERE job_id = ?1",
                    [&record.id],
                )
                .map_err(DatabaseError::Sqlite)?;
            record.attempt_count += 1;
            dispatch
                .running
                .insert(record.id.clone(), record.factory_key.clone());
            return Ok(Some(record));
        }

        Ok(None)
    }

    /// Settle a claimed record after its run.
    pub fn complete(&self, record: &JobRecord, job: &Job, outcome: &Result<()>) -> Result<Completion> {
        let db = lock(&self.inner.db, "complete job")?;
        let mut dispatch = self.dispatch()?;
        dispatch.running.remove(&record.id);
        let canceled = dispatch.cancel_requested.remove(&record.id);

        let completion = match outcome {
            Ok(()) => Completion::Done,
            Err(_) if canceled => Completion::Canceled,
            Err(e) if job.should_retry(e) && record.attempt_count < record.max_attempts => {
                let delay = self.inner.config.retry_backoff(record.attempt_count);
                Completion::Retry {
                    next_run_at: now_millis() + delay.as_millis() as i64,
                }
            }
            Err(_) => Completion::Dropped,
        };

        match completion {
            Completion::Retry { next_run_at } => {
                db.conn()
                    .execute(
                        "UPDATE jobs SET next_run_at = ?1 WHERE job_id = ?2",
                        params![next_run_at, record.id],
                    )
                    .map_err(DatabaseError::Sqlite)?;
            }
            _ => {
                db.conn()
                    .execute("DELETE FROM jobs WHERE job_id = ?1", [&record.id])
                    .map_err(DatabaseError::Sqlite)?;
            }
        }
        drop(dispatch);
        drop(db);

        match (&completion, outcome) {
            (Completion::Dropped, Err(e)) => warn!(
                "Dropping {} after attempt {}/{}: {}",
                record.factory_key, record.attempt_count, record.max_attempts, e
            ),
            (Completion::Retry { .. }, Err(e)) => info!(
                "Retrying {} after attempt {}/{}: {}",
                record.factory_key, record.attempt_count, record.max_attempts, e
            ),
            _ => {}
        }
        if completion == Completion::Canceled {
            job.on_canceled();
        }

        // Same-key records may have been waiting on this one.
        self.notify();
        Ok(completion)
    }

    /// Remove a claimed record that cannot be rebuilt into a job.
    pub fn discard(&self, record: &JobRecord) -> Result<()> {
        let db = lock(&self.inner.db, "discard job")?;
        let mut dispatch = self.dispatch()?;
        dispatch.running.remove(&record.id);
        dispatch.cancel_requested.remove(&record.id);
        db.conn()
            .execute("DELETE FROM jobs WHERE job_id = ?1", [&record.id])
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Hand back a claimed record whose run was interrupted by shutdown.
    /// The attempt is not counted.
    pub fn release(&self, record: &JobRecord) -> Result<()> {
        let db = lock(&self.inner.db, "release job")?;
        let mut dispatch = self.dispatch()?;
        dispatch.running.remove(&record.id);
        if dispatch.cancel_requested.remove(&record.id) {
            db.conn()
                .execute("DELETE FROM jobs WHERE job_id = ?1", [&record.id])
                .map_err(DatabaseError::Sqlite)?;
            return Ok(());
        }
        db.conn()
            .execute(
                "UPDATE jobs SET attempt_count = MAX(attempt_count - 1, 0) WHERE job_id = ?1",
                [&record.id],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Remove a record before it succeeds. A running record is removed when
    /// its run ends, and its cancel hook never overlaps the run.
    pub fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let db = lock(&self.inner.db, "cancel job")?;
        let mut dispatch = self.dispatch()?;

        if dispatch.running.contains_key(job_id) {
            dispatch.cancel_requested.insert(job_id.to_string());
            return Ok(CancelOutcome::Deferred);
        }

        let record = Self::load(db.conn(), "WHERE job_id = ?1", params![job_id])?
            .into_iter()
            .next()
            .ok_or_else(|| LinkError::NotFound(format!("job {}", job_id)))?;

        db.conn()
            .execute("DELETE FROM jobs WHERE job_id = ?1", [job_id])
            .map_err(DatabaseError::Sqlite)?;
        drop(dispatch);
        drop(db);

        match record.job() {
            Ok(job) => job.on_canceled(),
            Err(e) => warn!("Canceled unreadable job {}: {}", job_id, e),
        }
        Ok(CancelOutcome::Canceled)
    }

    fn drop_exhausted(&self) -> Result<()> {
        let db = lock(&self.inner.db, "recover jobs")?;
        let dropped = db
            .conn()
            .execute("DELETE FROM jobs WHERE attempt_count >= max_attempts", [])
            .map_err(DatabaseError::Sqlite)?;
        if dropped > 0 {
            warn!("Dropped {} jobs interrupted on their last attempt", dropped);
        }
        Ok(())
    }
}
