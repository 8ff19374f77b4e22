//! Fixed-size worker pool draining the job queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::job_queue::{JobQueue, QueuedJob};

/// Runs one dequeued job to completion.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: QueuedJob);

    /// Called instead of [`JobHandler::handle`] for jobs cancelled while queued.
    async fn skip(&self, job: QueuedJob) {
        drop(job);
    }
}

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of workers.
    pub workers: usize,
    /// How long `stop` waits for running jobs after cancelling them.
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            shutdown_grace_secs: 15,
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            tasks: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Spawn the workers. A second call while running is ignored.
    pub fn start(&self, queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            warn!("Worker pool already running");
            return;
        }
        let workers = self.config.workers.max(1);
        info!(workers, "Starting worker pool");

        let mut join_set = JoinSet::new();
        for worker in 0..workers {
            join_set.spawn(run_worker(worker, Arc::clone(&queue), Arc::clone(&handler)));
        }
        *tasks = Some(join_set);
    }

    /// Stop the pool: close the queue, cancel every live job, then wait up to
    /// the grace period for workers to drain before aborting them.
    pub async fn stop(&self, queue: &JobQueue) {
        queue.close();
        let cancelled = queue.cancel_all();
        info!(cancelled, "Stopping worker pool");

        // Take the join set out of the mutex before awaiting
        let join_set = self.tasks.lock().take();
        let Some(mut join_set) = join_set else {
            return;
        };

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Worker task ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = join_set.len(),
                "Workers did not stop within the grace period, aborting"
            );
            join_set.abort_all();
            while join_set.join_next().await.is_some() {}
        }
        info!("Worker pool stopped");
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn run_worker(worker: usize, queue: Arc<JobQueue>, handler: Arc<dyn JobHandler>) {
    debug!(worker, "Worker started");
    while let Some(job) = queue.dequeue().await {
        let job_id = job.job_id().clone();
        if job.is_cancelled() {
            debug!(worker, job_id = %job_id, "Skipping job cancelled while queued");
            handler.skip(job).await;
            continue;
        }

        debug!(worker, job_id = %job_id, "Worker picked job");
        // A panicking job must not take the worker down with it.
        if let Err(panic) = AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
            let reason = panic_message(panic.as_ref());
            error!(worker, job_id = %job_id, %reason, "Job handler panicked");
        }
    }
    debug!(worker, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AudioCodec, Availability, Container, FormatChoice, Job, Platform, StreamRef, VideoCodec,
    };
    use crate::pipeline::job_queue::JobQueueConfig;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    fn job(user: i64, url: &str) -> Job {
        let choice = FormatChoice {
            choice_id: "c".into(),
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
        };
        Job::new(user, user, Platform::Youtube, url, choice)
    }

    #[derive(Default)]
    struct RecordingHandler {
        handled: Mutex<Vec<String>>,
        skipped: Mutex<Vec<String>>,
        done: Notify,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: QueuedJob) {
            if job.job.url.ends_with("panic") {
                panic!("boom");
            }
            self.handled.lock().push(job.job.url.clone());
            self.done.notify_one();
        }

        async fn skip(&self, job: QueuedJob) {
            self.skipped.lock().push(job.job.url.clone());
            self.done.notify_one();
        }
    }

    #[tokio::test]
    async fn test_worker_survives_panic() {
        let queue = Arc::new(JobQueue::new(JobQueueConfig { capacity: 4 }).unwrap());
        let handler = Arc::new(RecordingHandler::default());
        let pool = WorkerPool::new(WorkerPoolConfig {
            workers: 1,
            shutdown_grace_secs: 1,
        });
        pool.start(queue.clone(), handler.clone());
        assert!(pool.is_running());

        queue.enqueue(job(1, "https://x.y/panic"), None).unwrap();
        queue.enqueue(job(1, "https://x.y/ok"), None).unwrap();
        handler.done.notified().await;

        assert_eq!(*handler.handled.lock(), vec!["https://x.y/ok".to_string()]);
        pool.stop(&queue).await;
        assert!(!pool.is_running());
        assert_eq!(queue.live_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped() {
        let queue = Arc::new(JobQueue::new(JobQueueConfig { capacity: 4 }).unwrap());
        let handler = Arc::new(RecordingHandler::default());
        let pool = WorkerPool::new(WorkerPoolConfig::default());

        let queued = job(1, "https://x.y/cancelled");
        let id = queued.id.clone();
        queue.enqueue(queued, None).unwrap();
        assert!(queue.cancel(&id));

        pool.start(queue.clone(), handler.clone());
        handler.done.notified().await;
        assert!(handler.handled.lock().is_empty());
        assert_eq!(*handler.skipped.lock(), vec!["https://x.y/cancelled".to_string()]);
        pool.stop(&queue).await;
    }

    #[tokio::test]
    async fn test_stop_closes_queue() {
        let queue = Arc::new(JobQueue::new(JobQueueConfig { capacity: 4 }).unwrap());
        let handler = Arc::new(RecordingHandler::default());
        let pool = WorkerPool::new(WorkerPoolConfig::default());
        pool.start(queue.clone(), handler.clone());
        pool.stop(&queue).await;
        assert!(queue.is_closed());
        assert!(queue.enqueue(job(1, "https://x.y/late"), None).is_err());
    }
}
