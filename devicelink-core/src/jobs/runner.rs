//! Worker pool draining the job queue.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::account::AccountHandle;
use crate::config::LinkConfig;
use crate::database::SharedDatabase;
use crate::jobs::{Completion, JobQueue, JobRecord};
use crate::service::{DirectoryService, MessageTransport, ProfileService};

/// Everything a running job may touch.
#[derive(Clone)]
pub struct JobContext {
    pub db: SharedDatabase,
    pub account: AccountHandle,
    pub queue: JobQueue,
    pub config: Arc<LinkConfig>,
    pub transport: Arc<dyn MessageTransport>,
    pub directory: Arc<dyn DirectoryService>,
    pub profiles: Arc<dyn ProfileService>,
}

/// A fixed set of workers, each claiming and running one record at a time.
pub struct JobRunner {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl JobRunner {
    /// Spawn `config.job_workers` workers on the current runtime.
    pub fn start(ctx: JobContext) -> Self {
        let (shutdown, _) = watch::channel(false);
        let count = ctx.config.job_workers.max(1);
        let workers = (0..count)
            .map(|worker| {
                let ctx = ctx.clone();
                let shutdown = shutdown.subscribe();
                tokio::spawn(async move { worker_loop(worker, ctx, shutdown).await })
            })
            .collect();
        info!("Job runner started with {} workers", count);

        Self { shutdown, workers }
    }

    /// Stop all workers. Runs in progress are interrupted and their records
    /// stay queued without the attempt counted.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    warn!("Job worker panicked: {}", e);
                }
            }
        }
        info!("Job runner stopped");
    }
}

async fn worker_loop(worker: usize, ctx: JobContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let wakeup = ctx.queue.wakeup().notified();
        tokio::pin!(wakeup);
        wakeup.as_mut().enable();

        match ctx.queue.claim_next() {
            Ok(Some(record)) => {
                run_record(worker, &ctx, record, &mut shutdown).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!("Worker {} could not claim a job: {}", worker, e),
        }

        tokio::select! {
            _ = &mut wakeup => {}
            _ = sleep(ctx.config.idle_poll()) => {}
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }
    debug!("Worker {} exiting", worker);
}

async fn run_record(
    worker: usize,
    ctx: &JobContext,
    record: JobRecord,
    shutdown: &mut watch::Receiver<bool>,
) {
    let job = match record.job() {
        Ok(job) => job,
        Err(e) => {
            warn!("Discarding unreadable job {} ({}): {}", record.id, record.factory_key, e);
            if let Err(e) = ctx.queue.discard(&record) {
                warn!("Failed to discard job {}: {}", record.id, e);
            }
            return;
        }
    };

    debug!(
        "Worker {} running {} ({}) attempt {}/{}",
        worker, record.factory_key, record.id, record.attempt_count, record.max_attempts
    );

    let outcome = tokio::select! {
        outcome = job.run(ctx) => outcome,
        _ = shutdown.wait_for(|stop| *stop) => {
            if let Err(e) = ctx.queue.release(&record) {
                warn!("Failed to release job {}: {}", record.id, e);
            }
            return;
        }
    };

    match ctx.queue.complete(&record, &job, &outcome) {
        Ok(Completion::Done) => debug!("{} ({}) finished", record.factory_key, record.id),
        Ok(_) => {}
        Err(e) => warn!("Failed to settle job {}: {}", record.id, e),
    }
}
