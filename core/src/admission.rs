//! Bounded-concurrency admission for inbound requests.
//!
//! Every request becomes a job that moves through
//! `Queued → Running → {Completed | TimedOut}`, or is `Rejected` on arrival
//! when the queue is full:
//!
//! - at most `concurrent_workers` jobs run at once;
//! - at most `max_queue_size` jobs are admitted (running + waiting);
//! - every job has `timeout` from the moment it was queued.
//!
//! Waiters get a worker slot in the order they were admitted; the slots
//! come from a fair semaphore.
//!
//! # Timeouts
//!
//! A job that times out while still waiting never runs. A job that times
//! out while running is reported to its caller as
//! [`AdmissionError::RequestTimeout`]; what happens to the handler depends
//! on [`TimeoutPolicy`]. With `Detach` (the default) it keeps running in the
//! background and holds its slots until it returns, so a stuck handler still
//! counts against the concurrency ceiling. With `Cancel` the handler task is
//! aborted and its slots are released right away.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Report the timeout, let the handler finish in the background.
    #[default]
    Detach,
    /// Report the timeout and abort the handler.
    Cancel,
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub concurrent_workers: usize,
    pub max_queue_size: usize,
    pub timeout: Duration,
    pub timeout_policy: TimeoutPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            concurrent_workers: 4,
            max_queue_size: 200,
            timeout: Duration::from_secs(30),
            timeout_policy: TimeoutPolicy::Detach,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("queue is full ({capacity} jobs admitted)")]
    QueueFull { capacity: usize },
    #[error("request timed out after {}ms", .after.as_millis())]
    RequestTimeout { after: Duration },
    #[error("request handler aborted")]
    Aborted,
}

/// Lifecycle of one job, as it shows up in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    TimedOut,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    pub running: usize,
    pub waiting: usize,
}

struct Inner {
    config: AdmissionConfig,
    workers: Arc<Semaphore>,
    /// Running + waiting.
    admitted: AtomicUsize,
    running: AtomicUsize,
    next_job: AtomicU64,
}

/// Cheap to clone; clones share the same limits.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<Inner>,
}

impl AdmissionQueue {
    pub fn new(config: AdmissionConfig) -> Self {
        // a zero-worker queue would only ever time out
        let workers = config.concurrent_workers.max(1);
        Self {
            inner: Arc::new(Inner {
                workers: Arc::new(Semaphore::new(workers)),
                config,
                admitted: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                next_job: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> AdmissionStats {
        let admitted = self.inner.admitted.load(Ordering::SeqCst);
        let running = self.inner.running.load(Ordering::SeqCst);
        AdmissionStats {
            running,
            waiting: admitted.saturating_sub(running),
        }
    }

    /// Run `job` under the queue's limits.
    ///
    /// The job is spawned onto the runtime once it gets a worker slot, which
    /// is why it must be `'static`.
    pub async fn submit<F, T>(&self, job: F) -> Result<T, AdmissionError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.inner.next_job.fetch_add(1, Ordering::Relaxed);
        let timeout = self.inner.config.timeout;
        let deadline = Instant::now() + timeout;

        let ticket = match self.admit() {
            Some(ticket) => ticket,
            None => {
                let capacity = self.inner.config.max_queue_size;
                tracing::warn!(job = id, state = ?JobState::Rejected, capacity, "Admission queue full");
                return Err(AdmissionError::QueueFull { capacity });
            }
        };
        tracing::debug!(job = id, state = ?JobState::Queued, "Job admitted");

        let permit = match tokio::time::timeout_at(
            deadline,
            self.inner.workers.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // the semaphore is never closed
            Ok(Err(_)) => return Err(AdmissionError::Aborted),
            Err(_) => {
                tracing::warn!(job = id, state = ?JobState::TimedOut, "Job timed out while queued");
                return Err(AdmissionError::RequestTimeout { after: timeout });
            }
        };

        let running = RunningGuard::enter(&self.inner);
        tracing::debug!(job = id, state = ?JobState::Running, "Job started");

        let mut handle = tokio::spawn(async move {
            // released when the handler actually returns
            let _slots = (ticket, permit, running);
            job.await
        });

        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(value)) => {
                tracing::debug!(job = id, state = ?JobState::Completed, "Job completed");
                Ok(value)
            }
            Ok(Err(e)) => {
                tracing::warn!(job = id, "Job handler failed: {}", e);
                Err(AdmissionError::Aborted)
            }
            Err(_) => {
                match self.inner.config.timeout_policy {
                    TimeoutPolicy::Cancel => handle.abort(),
                    TimeoutPolicy::Detach => {}
                }
                tracing::warn!(
                    job = id,
                    state = ?JobState::TimedOut,
                    policy = ?self.inner.config.timeout_policy,
                    "Job timed out while running"
                );
                Err(AdmissionError::RequestTimeout { after: timeout })
            }
        }
    }

    fn admit(&self) -> Option<Ticket> {
        let max = self.inner.config.max_queue_size;
        self.inner
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(Ticket {
            inner: self.inner.clone(),
        })
    }
}

/// One admitted job's place in the queue.
struct Ticket {
    inner: Arc<Inner>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.inner.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}

struct RunningGuard {
    inner: Arc<Inner>,
}

impl RunningGuard {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.running.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: inner.clone(),
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(workers: usize, size: usize, timeout_ms: u64) -> AdmissionQueue {
        AdmissionQueue::new(AdmissionConfig {
            concurrent_workers: workers,
            max_queue_size: size,
            timeout: Duration::from_millis(timeout_ms),
            timeout_policy: TimeoutPolicy::Detach,
        })
    }

    #[tokio::test]
    async fn test_completed_job_passes_result_through() {
        let q = queue(2, 10, 1_000);
        assert_eq!(q.submit(async { 41 + 1 }).await, Ok(42));
        assert_eq!(q.stats(), AdmissionStats { running: 0, waiting: 0 });
    }

    #[tokio::test]
    async fn test_zero_capacity_rejects_everything() {
        let q = queue(1, 0, 1_000);
        assert_eq!(
            q.submit(async {}).await,
            Err(AdmissionError::QueueFull { capacity: 0 })
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_aborted() {
        let q = queue(1, 10, 1_000);
        let result = q.submit(async { panic!("boom") }).await;
        assert_eq!(result, Err::<(), _>(AdmissionError::Aborted));
        // slot is back
        assert_eq!(q.submit(async { 1 }).await, Ok(1));
    }

    #[test]
    fn test_defaults() {
        let config = AdmissionConfig::default();
        assert_eq!(config.concurrent_workers, 4);
        assert_eq!(config.max_queue_size, 200);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.timeout_policy, TimeoutPolicy::Detach);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            AdmissionError::QueueFull { capacity: 200 }.to_string(),
            "queue is full (200 jobs admitted)"
        );
        assert_eq!(
            AdmissionError::RequestTimeout {
                after: Duration::from_secs(30)
            }
            .to_string(),
            "request timed out after 30000ms"
        );
    }
}
