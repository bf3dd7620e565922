//! Typed job queue over the one store this crate owns (§4.2).
//!
//! The originating system leans on Redis/BullMQ; that collaborator is out of scope
//! (§1), so `SqliteQueue` satisfies the same `QueueAdapter` contract against the SQLite
//! `jobs` table. `REDIS_URL` is still accepted and parsed by `Config` for interface
//! compatibility — swapping in a Redis-backed adapter later is additive, not a rewrite.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use rand::Rng;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::ConductorError;
use crate::store::StoreHandle;
use crate::store::models::Job;

pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), ConductorError>> + Send>>;
pub type JobHandler = Arc<dyn Fn(Value) -> JobFuture + Send + Sync>;

const MAX_ATTEMPTS: i64 = 8;
const POLL_INTERVAL: StdDuration = StdDuration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct QueueHealth {
    pub healthy: bool,
    pub latency_ms: u64,
}

/// A started consumer; dropping or calling `stop` signals all its worker tasks to
/// finish their current job and exit (§4.2 `close`: "waits for in-flight jobs").
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

#[async_trait]
pub trait QueueAdapter: Send + Sync {
    async fn add_job(&self, queue: &str, job_id: &str, payload: Value) -> Result<Job>;

    fn create_worker(&self, queue: &'static str, concurrency: usize, handler: JobHandler) -> WorkerHandle;

    async fn clean(&self, queue: &str, grace: Duration, limit: usize, status: &str) -> Result<Vec<String>>;

    async fn health_check(&self) -> QueueHealth;

    async fn close(&self);
}

pub struct SqliteQueue {
    store: StoreHandle,
}

impl SqliteQueue {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }
}

/// Exponential backoff with jitter (§4.2). Capped at five minutes so a stuck handler
/// does not push retries arbitrarily far into the future.
fn backoff_delay(attempts: i64) -> StdDuration {
    let base_secs = 2u64.saturating_pow(attempts.clamp(0, 10) as u32).min(300);
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    StdDuration::from_secs(base_secs) + StdDuration::from_millis(jitter_ms)
}

#[async_trait]
impl QueueAdapter for SqliteQueue {
    async fn add_job(&self, queue: &str, job_id: &str, payload: Value) -> Result<Job> {
        let queue = queue.to_string();
        let job_id = job_id.to_string();
        self.store
            .call(move |db| db.insert_job_if_new(&queue, &job_id, &payload))
            .await
    }

    fn create_worker(&self, queue: &'static str, concurrency: usize, handler: JobHandler) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::with_capacity(concurrency);
        for worker_index in 0..concurrency.max(1) {
            let store = self.store.clone();
            let handler = handler.clone();
            let mut shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                    let claimed = store.call(move |db| db.claim_next_job(queue)).await;
                    let job = match claimed {
                        Ok(Some(job)) => job,
                        Ok(None) => {
                            tokio::select! {
                                _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                                _ = shutdown_rx.changed() => continue,
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, queue, worker_index, "failed to claim job");
                            tokio::time::sleep(POLL_INTERVAL).await;
                            continue;
                        }
                    };

                    let job_id = job.job_id.clone();
                    let result = handler(job.payload.clone()).await;
                    match result {
                        Ok(()) => {
                            if let Err(err) = store
                                .call({
                                    let job_id = job_id.clone();
                                    move |db| db.mark_job_completed(queue, &job_id)
                                })
                                .await
                            {
                                warn!(error = %err, queue, job_id, "failed to mark job completed");
                            }
                        }
                        Err(err) if err.is_retryable() => {
                            let attempts = job.attempts + 1;
                            if attempts >= MAX_ATTEMPTS {
                                let message = err.to_string();
                                if let Err(e) = store
                                    .call({
                                        let job_id = job_id.clone();
                                        move |db| db.mark_job_failed(queue, &job_id, &message)
                                    })
                                    .await
                                {
                                    warn!(error = %e, queue, job_id, "failed to mark job permanently failed");
                                }
                            } else {
                                let retry_at = chrono::Utc::now()
                                    + chrono::Duration::from_std(backoff_delay(attempts)).unwrap_or_default();
                                let message = err.to_string();
                                if let Err(e) = store
                                    .call({
                                        let job_id = job_id.clone();
                                        move |db| db.reschedule_job(queue, &job_id, &message, retry_at)
                                    })
                                    .await
                                {
                                    warn!(error = %e, queue, job_id, "failed to reschedule job");
                                }
                            }
                        }
                        Err(err) => {
                            // Permanent errors must not be retried silently (§7): the
                            // handler is expected to have already updated application
                            // state; the job itself is simply marked done.
                            warn!(error = %err, queue, job_id, "job handler returned permanent error");
                            if let Err(e) = store
                                .call({
                                    let job_id = job_id.clone();
                                    move |db| db.mark_job_completed(queue, &job_id)
                                })
                                .await
                            {
                                warn!(error = %e, queue, job_id, "failed to mark job completed after permanent error");
                            }
                        }
                    }
                }
            }));
        }
        info!(queue, concurrency, "worker started");
        WorkerHandle { shutdown_tx, tasks }
    }

    async fn clean(&self, queue: &str, grace: Duration, limit: usize, status: &str) -> Result<Vec<String>> {
        let queue = queue.to_string();
        let status = status.to_string();
        self.store
            .call(move |db| db.clean_jobs(&queue, &status, grace, limit))
            .await
    }

    async fn health_check(&self) -> QueueHealth {
        let start = std::time::Instant::now();
        let healthy = self.store.call(|db| db.transaction(|_tx| Ok(()))).await.is_ok();
        QueueHealth { healthy, latency_ms: start.elapsed().as_millis() as u64 }
    }

    async fn close(&self) {
        // Nothing to disconnect for the SQLite-backed adapter; the store owns the
        // connection lifecycle. Present for contract parity with a Redis-backed
        // implementation.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn add_job_is_idempotent() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let queue = SqliteQueue::new(store);
        let first = queue.add_job("runs", "r1", serde_json::json!({"action": "start"})).await.unwrap();
        let second = queue.add_job("runs", "r1", serde_json::json!({"action": "cancel"})).await.unwrap();
        assert_eq!(first.payload, second.payload);
    }

    #[tokio::test]
    async fn worker_processes_enqueued_job_exactly_once() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let queue = SqliteQueue::new(store);
        queue.add_job("runs", "r1", serde_json::json!({"action": "start"})).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let handler: JobHandler = Arc::new(move |_payload| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let worker = queue.create_worker("runs", 1, handler);
        tokio::time::sleep(StdDuration::from_millis(400)).await;
        worker.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_check_reports_healthy() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let queue = SqliteQueue::new(store);
        assert!(queue.health_check().await.healthy);
    }
}
