//! Per-job stage machine run by a worker.
//!
//! `Analyzing → Downloading → Merging → Validating → Sending → Done`, with a
//! cancellation check at every stage boundary. Whatever the outcome, the temp
//! area is destroyed and the job's lease (active-job slot and live token) is
//! released before the final event is published.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cancellation::{ensure_not_cancelled, race_cancellation};
use super::job_queue::QueuedJob;
use super::worker_pool::{JobHandler, panic_message};
use crate::delivery::{DeliveryClient, StatusHandle, StatusPresenter};
use crate::domain::{Container, Job, JobId, JobStage, UserId};
use crate::media::{Muxer, ProbeReport, Prober, StreamDownloader};
use crate::messages;
use crate::policy::ChannelLimits;
use crate::storage::{TempArea, TempAreaManager};
use crate::{Error, Result};

/// Lifecycle notifications for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StageChanged {
        job_id: JobId,
        user_id: UserId,
        stage: JobStage,
    },
    /// Published after every resource of the job has been released.
    Finished {
        job_id: JobId,
        user_id: UserId,
        stage: JobStage,
        error: Option<String>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::StageChanged { job_id, .. } | Self::Finished { job_id, .. } => job_id,
        }
    }
}

/// External collaborators a job needs.
pub struct PipelineCollaborators {
    pub downloader: Arc<dyn StreamDownloader>,
    pub muxer: Arc<dyn Muxer>,
    pub prober: Arc<dyn Prober>,
    pub delivery: Arc<DeliveryClient>,
    pub status: Arc<StatusPresenter>,
}

pub struct JobPipeline {
    downloader: Arc<dyn StreamDownloader>,
    muxer: Arc<dyn Muxer>,
    prober: Arc<dyn Prober>,
    delivery: Arc<DeliveryClient>,
    status: Arc<StatusPresenter>,
    temp: TempAreaManager,
    limits: ChannelLimits,
    events: broadcast::Sender<JobEvent>,
}

/// Per-run state the cleanup step needs regardless of where the run stopped.
#[derive(Default)]
struct RunState {
    status: Option<StatusHandle>,
    area: Option<TempArea>,
}

impl JobPipeline {
    pub fn new(collaborators: PipelineCollaborators, temp: TempAreaManager, limits: ChannelLimits) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            downloader: collaborators.downloader,
            muxer: collaborators.muxer,
            prober: collaborators.prober,
            delivery: collaborators.delivery,
            status: collaborators.status,
            temp,
            limits,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn enter(&self, job: &mut Job, token: &CancellationToken, stage: JobStage) -> Result<()> {
        ensure_not_cancelled(token)?;
        job.transition(stage)?;
        debug!(job_id = %job.id, user_id = job.user_id, stage = %stage, "Stage entered");
        self.publish(JobEvent::StageChanged {
            job_id: job.id.clone(),
            user_id: job.user_id,
            stage,
        });
        Ok(())
    }

    async fn show(&self, status: Option<StatusHandle>, text: &str) {
        if let Some(handle) = status {
            self.status.stop_loop(handle).await;
            if let Err(e) = self.status.set_text(handle, text).await {
                warn!(chat_id = handle.chat, error = %e, "Failed to update status");
            }
        }
    }

    async fn animate(&self, status: Option<StatusHandle>, frames: &'static [&'static str]) {
        if let Some(handle) = status {
            self.status.start_loop(handle, frames).await;
        }
    }

    async fn run(&self, job: &mut Job, token: &CancellationToken, state: &mut RunState) -> Result<()> {
        self.enter(job, token, JobStage::Analyzing)?;
        state.status = match job.status_message_id {
            Some(message) => {
                let handle = self.status.attach(job.chat_id, message);
                self.show(Some(handle), messages::STATUS_ANALYZING).await;
                Some(handle)
            }
            None => match self.status.begin(job.chat_id, messages::STATUS_ANALYZING).await {
                Ok(handle) => {
                    job.status_message_id = Some(handle.message);
                    Some(handle)
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to post status message");
                    None
                }
            },
        };
        let area = self.temp.allocate(&job.id).await?;
        let output = area.file(&output_file_name(job));
        let (source_stem, video_stem, audio_stem) =
            (area.file("source"), area.file("video"), area.file("audio"));
        state.area = Some(area);

        self.enter(job, token, JobStage::Downloading)?;
        self.animate(state.status, messages::DOWNLOAD_FRAMES).await;
        let choice = &job.choice;
        if choice.is_progressive() {
            let source = self
                .downloader
                .download(&job.url, &choice.video.stream_id, &source_stem, token)
                .await?;

            self.enter(job, token, JobStage::Merging)?;
            self.show(state.status, messages::STATUS_MERGING).await;
            self.muxer
                .remux(&source, &output, job.choice.container, token)
                .await?;
        } else {
            let video = self
                .downloader
                .download(&job.url, &choice.video.stream_id, &video_stem, token)
                .await?;
            ensure_not_cancelled(token)?;
            let audio = self
                .downloader
                .download(&job.url, &choice.audio.stream_id, &audio_stem, token)
                .await?;

            self.enter(job, token, JobStage::Merging)?;
            self.show(state.status, messages::STATUS_MERGING).await;
            self.muxer
                .merge(&video, &audio, &output, job.choice.container, token)
                .await?;
        }

        self.enter(job, token, JobStage::Validating)?;
        self.show(state.status, messages::STATUS_VALIDATING).await;
        let report = race_cancellation(token, self.prober.probe(&output)).await?;
        validate_artifact(&report, &output, job.choice.container, &self.limits)?;

        self.enter(job, token, JobStage::Sending)?;
        self.animate(state.status, messages::UPLOAD_FRAMES).await;
        let mode = self.delivery.deliver(job.chat_id, &output, token).await?;
        info!(
            job_id = %job.id,
            user_id = job.user_id,
            size = report.size_bytes,
            mode = mode.as_str(),
            "Artifact delivered"
        );

        job.transition(JobStage::Done)?;
        Ok(())
    }

    async fn finish(&self, job: &mut Job, token: &CancellationToken, state: RunState, result: Result<()>) {
        let stage = final_stage(&result, token);
        if job.stage() != stage
            && let Err(e) = job.transition(stage)
        {
            error!(job_id = %job.id, error = %e, "Invalid final transition");
        }

        match (&result, state.status) {
            (Ok(()), Some(handle)) => self.status.finish(handle, messages::STATUS_DONE).await,
            (Err(_), Some(handle)) if stage == JobStage::Cancelled => self.status.remove(handle).await,
            (Err(e), Some(handle)) => self.status.fail(handle, e.user_message()).await,
            (_, None) => {}
        }

        if let Some(area) = state.area
            && let Err(e) = area.destroy().await
        {
            warn!(job_id = %job.id, error = %e, "Failed to destroy temp area");
        }

        match &result {
            Ok(()) => info!(job_id = %job.id, user_id = job.user_id, "Job done"),
            Err(_) if stage == JobStage::Cancelled => {
                info!(job_id = %job.id, user_id = job.user_id, "Job cancelled")
            }
            Err(e) => error!(
                job_id = %job.id,
                user_id = job.user_id,
                kind = ?e.kind(),
                error = %e,
                "Job failed"
            ),
        }
    }
}

#[async_trait]
impl JobHandler for JobPipeline {
    async fn handle(&self, queued: QueuedJob) {
        let (mut job, token, lease) = queued.into_parts();
        info!(
            job_id = %job.id,
            user_id = job.user_id,
            platform = %job.platform,
            choice = %job.choice.label,
            "Job started"
        );

        let mut state = RunState::default();
        // A panic fails the job like any other error so cleanup still runs.
        let result = AssertUnwindSafe(self.run(&mut job, &token, &mut state))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::invariant(format!("job panicked: {}", panic_message(panic.as_ref()))))
            });
        let error = match &result {
            Err(e) if !e.is_cancelled() => Some(e.to_string()),
            _ => None,
        };
        self.finish(&mut job, &token, state, result).await;
        drop(lease);

        self.publish(JobEvent::Finished {
            job_id: job.id.clone(),
            user_id: job.user_id,
            stage: job.stage(),
            error,
        });
    }

    async fn skip(&self, queued: QueuedJob) {
        let (mut job, _token, lease) = queued.into_parts();
        if let Err(e) = job.transition(JobStage::Cancelled) {
            error!(job_id = %job.id, error = %e, "Invalid final transition");
        }
        if let Some(message) = job.status_message_id {
            let handle = self.status.attach(job.chat_id, message);
            self.status.remove(handle).await;
        }
        drop(lease);
        info!(job_id = %job.id, user_id = job.user_id, "Job cancelled before start");
        self.publish(JobEvent::Finished {
            job_id: job.id.clone(),
            user_id: job.user_id,
            stage: JobStage::Cancelled,
            error: None,
        });
    }
}

/// Outcome of a run. A failure after cancellation counts as a cancel,
/// except an upload that may already have landed: the user must hear
/// about that one.
fn final_stage(result: &Result<()>, token: &CancellationToken) -> JobStage {
    match result {
        Ok(()) => JobStage::Done,
        Err(e) if e.is_cancelled() => JobStage::Cancelled,
        Err(Error::DeliveryUncertain(_)) => JobStage::Failed,
        Err(_) if token.is_cancelled() => JobStage::Cancelled,
        Err(_) => JobStage::Failed,
    }
}

/// `{platform}_{height}p.{ext}`
pub fn output_file_name(job: &Job) -> String {
    format!("{}_{}p.{}", job.platform, job.choice.height, job.choice.ext())
}

/// Check a merged artifact before it is handed to the channel.
pub fn validate_artifact(
    report: &ProbeReport,
    path: &Path,
    container: Container,
    limits: &ChannelLimits,
) -> Result<()> {
    if report.size_bytes == 0 {
        return Err(Error::InvalidArtifact("file is empty".to_string()));
    }
    if report.size_bytes > limits.hard_bytes {
        return Err(Error::InvalidArtifact(format!(
            "file of {} bytes exceeds the channel limit",
            report.size_bytes
        )));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if ext.as_deref() != Some(container.ext()) {
        return Err(Error::InvalidArtifact(format!(
            "extension {:?} does not match container {container}",
            ext.unwrap_or_default()
        )));
    }
    match report.format_name.as_deref() {
        Some(name) if container.matches_format_name(name) => {}
        other => {
            return Err(Error::InvalidArtifact(format!(
                "probed format {:?} does not match container {container}",
                other.unwrap_or("unknown")
            )));
        }
    }

    if !report.has_video {
        return Err(Error::InvalidArtifact("no video stream".to_string()));
    }
    if !report.has_audio {
        return Err(Error::InvalidArtifact("no audio stream".to_string()));
    }
    if let Some(duration) = report.duration_secs
        && !(duration.is_finite() && duration > 0.0)
    {
        return Err(Error::InvalidArtifact(format!(
            "non-positive duration {duration}"
        )));
    }
    Ok(())
}
