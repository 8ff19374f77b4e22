//! Job execution: bounded queue, worker pool and the per-job stage machine.

pub mod cancellation;
pub mod job_pipeline;
pub mod job_queue;
pub mod worker_pool;

pub use cancellation::{ensure_not_cancelled, race_cancellation};
pub use job_pipeline::{JobEvent, JobPipeline, PipelineCollaborators, validate_artifact};
pub use job_queue::{JobLease, JobQueue, JobQueueConfig, QueuedJob};
pub use worker_pool::{JobHandler, WorkerPool, WorkerPoolConfig};
