//! Bounded job queue with per-job cancellation tokens.
//!
//! Every accepted job owns a [`CancellationToken`] registered in a live map
//! until the job's [`JobLease`] is dropped. The lease also carries the
//! user's active-job slot, so whichever way a job ends (finished, skipped,
//! rejected at enqueue, dropped during shutdown) both are released exactly
//! once.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::admission::ActiveJobGuard;
use crate::domain::{Job, JobId, UserId};
use crate::{Error, Result};

/// Configuration for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQueueConfig {
    /// Jobs that may wait for a worker at once.
    pub capacity: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self { capacity: 32 }
    }
}

#[derive(Debug, Clone)]
struct LiveJob {
    user_id: UserId,
    token: CancellationToken,
}

/// Removes the job's token from the live map when dropped.
#[derive(Debug)]
struct Registration {
    live: Arc<DashMap<JobId, LiveJob>>,
    job_id: JobId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.live.remove(&self.job_id);
    }
}

/// Resources held by a job for its whole life.
#[derive(Debug)]
pub struct JobLease {
    slot: Option<ActiveJobGuard>,
    registration: Registration,
}

/// A job as handed to a worker.
#[derive(Debug)]
pub struct QueuedJob {
    pub job: Job,
    pub token: CancellationToken,
    lease: JobLease,
}

impl QueuedJob {
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn into_parts(self) -> (Job, CancellationToken, JobLease) {
        (self.job, self.token, self.lease)
    }
}

/// Bounded FIFO shared by a fixed set of workers.
pub struct JobQueue {
    capacity: usize,
    sender: parking_lot::Mutex<Option<mpsc::Sender<QueuedJob>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<QueuedJob>>,
    live: Arc<DashMap<JobId, LiveJob>>,
}

impl JobQueue {
    pub fn new(config: JobQueueConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(Error::config("queue capacity must be positive"));
        }
        let (sender, receiver) = mpsc::channel(config.capacity);
        Ok(Self {
            capacity: config.capacity,
            sender: parking_lot::Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            live: Arc::new(DashMap::new()),
        })
    }

    /// Queue a job without waiting.
    ///
    /// On success the job's cancellation token is returned. On failure the
    /// job is dropped together with `slot`, so the caller's slot is
    /// released.
    pub fn enqueue(&self, job: Job, slot: Option<ActiveJobGuard>) -> Result<CancellationToken> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(Error::ShuttingDown);
        };

        let job_id = job.id.clone();
        let user_id = job.user_id;
        let token = CancellationToken::new();
        self.live.insert(
            job_id.clone(),
            LiveJob {
                user_id,
                token: token.clone(),
            },
        );
        let queued = QueuedJob {
            job,
            token: token.clone(),
            lease: JobLease {
                slot,
                registration: Registration {
                    live: Arc::clone(&self.live),
                    job_id: job_id.clone(),
                },
            },
        };

        match sender.try_send(queued) {
            Ok(()) => {
                debug!(job_id = %job_id, user_id, "Job enqueued");
                Ok(token)
            }
            Err(TrySendError::Full(rejected)) => {
                drop(rejected);
                debug!(job_id = %job_id, user_id, "Queue full, job rejected");
                Err(Error::QueueFull)
            }
            Err(TrySendError::Closed(rejected)) => {
                drop(rejected);
                Err(Error::ShuttingDown)
            }
        }
    }

    /// Wait for the next job. Returns `None` once the queue is closed and
    /// drained.
    pub async fn dequeue(&self) -> Option<QueuedJob> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await
    }

    /// Cancel one live job.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        match self.live.get(job_id) {
            Some(entry) => {
                entry.token.cancel();
                info!(job_id = %job_id, user_id = entry.user_id, "Job cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel one live job only if it belongs to `user`.
    pub fn cancel_owned(&self, user: UserId, job_id: &JobId) -> bool {
        let owned = self
            .live
            .get(job_id)
            .is_some_and(|entry| entry.user_id == user);
        owned && self.cancel(job_id)
    }

    /// Cancel every live job of a user; returns how many were cancelled.
    pub fn cancel_user(&self, user: UserId) -> usize {
        let tokens: Vec<(JobId, CancellationToken)> = self
            .live
            .iter()
            .filter(|e| e.value().user_id == user && !e.value().token.is_cancelled())
            .map(|e| (e.key().clone(), e.value().token.clone()))
            .collect();
        for (job_id, token) in &tokens {
            token.cancel();
            info!(job_id = %job_id, user_id = user, "Job cancellation requested");
        }
        tokens.len()
    }

    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.live.iter() {
            entry.value().token.cancel();
            count += 1;
        }
        count
    }

    /// Stop accepting jobs. Already queued jobs can still be dequeued.
    pub fn close(&self) {
        if self.sender.lock().take().is_some() {
            info!("Job queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub fn is_live(&self, job_id: &JobId) -> bool {
        self.live.contains_key(job_id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Jobs waiting for a worker.
    pub fn queued_len(&self) -> usize {
        match self.sender.lock().as_ref() {
            Some(sender) => self.capacity - sender.capacity(),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ActiveJobRegistry;
    use crate::domain::{
        AudioCodec, Availability, Container, FormatChoice, Platform, StreamRef, VideoCodec,
    };

    fn choice() -> FormatChoice {
        FormatChoice {
            choice_id: "abc".into(),
            label: "720p".into(),
            container: Container::Mp4,
            availability: Availability::Guaranteed,
            video: StreamRef {
                stream_id: "v".into(),
                bitrate_kbps: None,
            },
            audio: StreamRef {
                stream_id: "a".into(),
                bitrate_kbps: None,
            },
            height: 720,
            fps: 30,
            video_codec: VideoCodec::H264,
            audio_codec: AudioCodec::Aac,
            estimated_bytes: None,
        }
    }

    fn job(user: UserId) -> Job {
        Job::new(user, user, Platform::Youtube, "https://youtu.be/x", choice())
    }

    fn queue(capacity: usize) -> JobQueue {
        JobQueue::new(JobQueueConfig { capacity }).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(JobQueue::new(JobQueueConfig { capacity: 0 }).is_err());
    }

    #[tokio::test]
    async fn test_enqueue_registers_token() {
        let queue = queue(2);
        let job = job(1);
        let id = job.id.clone();
        let token = queue.enqueue(job, None).unwrap();
        assert!(queue.is_live(&id));
        assert_eq!(queue.queued_len(), 1);

        assert!(queue.cancel(&id));
        assert!(token.is_cancelled());

        let dequeued = queue.dequeue().await.unwrap();
        assert!(dequeued.is_cancelled());
        drop(dequeued);
        assert!(!queue.is_live(&id));
        assert!(!queue.cancel(&id));
    }

    #[tokio::test]
    async fn test_full_queue_releases_slot() {
        let registry = Arc::new(ActiveJobRegistry::new(1));
        let queue = queue(1);

        let first = registry.try_acquire_guard(1).unwrap();
        queue.enqueue(job(1), Some(first)).unwrap();

        let second = registry.try_acquire_guard(2).unwrap();
        let rejected = job(2);
        let rejected_id = rejected.id.clone();
        let err = queue.enqueue(rejected, Some(second)).unwrap_err();
        assert!(matches!(err, Error::QueueFull));
        assert_eq!(registry.active(2), 0);
        assert_eq!(registry.active(1), 1);
        assert!(!queue.is_live(&rejected_id));
        assert_eq!(registry.violations(), 0);
    }

    #[tokio::test]
    async fn test_lease_releases_slot_once() {
        let registry = Arc::new(ActiveJobRegistry::new(1));
        let queue = queue(4);
        let slot = registry.try_acquire_guard(7).unwrap();
        queue.enqueue(job(7), Some(slot)).unwrap();
        assert_eq!(registry.active(7), 1);

        let (_job, _token, lease) = queue.dequeue().await.unwrap().into_parts();
        assert!(lease.slot.is_some());
        drop(lease);
        assert_eq!(registry.active(7), 0);
        assert_eq!(registry.violations(), 0);
        assert_eq!(queue.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_user_and_owned() {
        let queue = queue(8);
        let a1 = job(1);
        let a1_id = a1.id.clone();
        let t1 = queue.enqueue(a1, None).unwrap();
        let t2 = queue.enqueue(job(1), None).unwrap();
        let b = job(2);
        let b_id = b.id.clone();
        let t3 = queue.enqueue(b, None).unwrap();

        assert!(!queue.cancel_owned(1, &b_id));
        assert!(!t3.is_cancelled());
        assert_eq!(queue.live_count(), 3);

        assert!(queue.cancel_owned(1, &a1_id));
        assert!(t1.is_cancelled());
        assert_eq!(queue.cancel_user(1), 1);
        assert!(t2.is_cancelled());
        assert_eq!(queue.cancel_user(1), 0);
        assert!(!t3.is_cancelled());
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = queue(4);
        queue.enqueue(job(1), None).unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(job(2), None),
            Err(Error::ShuttingDown)
        ));
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let queue = queue(4);
        let t1 = queue.enqueue(job(1), None).unwrap();
        let t2 = queue.enqueue(job(2), None).unwrap();
        assert_eq!(queue.cancel_all(), 2);
        assert!(t1.is_cancelled() && t2.is_cancelled());
    }
}
