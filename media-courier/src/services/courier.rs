//! The courier service: the surface the chat front talks to.
//!
//! Admission happens here, synchronously with the user's action: rate limit,
//! session lookup, availability, choice sanity, per-user cap and queue room.
//! A job only exists once all of them pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::admission::{ActiveJobRegistry, RateLimiter, RateLimiterConfig, SessionCache};
use crate::config::AppConfig;
use crate::delivery::{DeliveryChannel, DeliveryClient, StatusPresenter};
use crate::domain::{
    Availability, ChatId, FormatChoice, Job, JobId, Platform, UserId, validate_choice, validate_url,
};
use crate::media::{Extractor, Muxer, Prober, StreamDownloader};
use crate::messages;
use crate::pipeline::{
    JobEvent, JobPipeline, JobQueue, JobQueueConfig, PipelineCollaborators, WorkerPool,
    WorkerPoolConfig,
};
use crate::policy::{ChannelLimits, FormatPolicyEngine, RiskPolicy};
use crate::storage::TempAreaManager;
use crate::{Error, ErrorKind, Result};

/// External collaborators of the service.
pub struct CourierCollaborators {
    pub extractor: Arc<dyn Extractor>,
    pub downloader: Arc<dyn StreamDownloader>,
    pub muxer: Arc<dyn Muxer>,
    pub prober: Arc<dyn Prober>,
    pub channel: Arc<dyn DeliveryChannel>,
}

/// Tunables of the service.
#[derive(Debug, Clone)]
pub struct CourierSettings {
    pub limits: ChannelLimits,
    pub risk: RiskPolicy,
    pub queue: JobQueueConfig,
    pub pool: WorkerPoolConfig,
    pub rate_limit: RateLimiterConfig,
    pub max_active_jobs_per_user: usize,
    pub session_ttl: Duration,
    pub temp_root: PathBuf,
    pub status_min_interval: Duration,
    pub status_loop_interval: Duration,
    pub upload_rate_limit_retries: u32,
}

impl CourierSettings {
    /// Defaults with the given temp root.
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            limits: ChannelLimits::default(),
            risk: RiskPolicy::default(),
            queue: JobQueueConfig::default(),
            pool: WorkerPoolConfig::default(),
            rate_limit: RateLimiterConfig::default(),
            max_active_jobs_per_user: 1,
            session_ttl: Duration::from_secs(900),
            temp_root: temp_root.into(),
            status_min_interval: Duration::from_secs(1),
            status_loop_interval: Duration::from_millis(1500),
            upload_rate_limit_retries: 3,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limits: config.channel.to_limits(),
            risk: config.risk.clone(),
            queue: config.queue.job_queue(),
            pool: config.queue.worker_pool(),
            rate_limit: config.limits.rate_limiter(),
            max_active_jobs_per_user: config.limits.max_active_jobs_per_user,
            session_ttl: config.limits.session_ttl(),
            temp_root: config.temp_root.clone(),
            status_min_interval: config.status.min_edit_interval(),
            status_loop_interval: config.status.loop_interval(),
            upload_rate_limit_retries: 3,
        }
    }
}

/// Choices offered for a link.
#[derive(Debug, Clone)]
pub struct ChoicesResult {
    pub title: Option<String>,
    pub choices: Vec<FormatChoice>,
    pub session_version: u64,
}

/// Outcome of a button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub accepted: bool,
    pub message: &'static str,
    pub job_id: Option<JobId>,
}

impl SubmitResult {
    fn rejected(error: &Error) -> Self {
        Self {
            accepted: false,
            message: error.user_message(),
            job_id: None,
        }
    }
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelResult {
    pub cancelled: bool,
    pub message: &'static str,
}

pub struct CourierService {
    policy: FormatPolicyEngine,
    extractor: Arc<dyn Extractor>,
    sessions: SessionCache,
    rate_limiter: RateLimiter,
    active_jobs: Arc<ActiveJobRegistry>,
    queue: Arc<JobQueue>,
    pool: WorkerPool,
    pipeline: Arc<JobPipeline>,
    temp: TempAreaManager,
    status: Arc<StatusPresenter>,
}

impl CourierService {
    pub fn new(collaborators: CourierCollaborators, settings: CourierSettings) -> Result<Self> {
        settings.limits.validate()?;
        settings.risk.validate()?;

        let temp = TempAreaManager::new(settings.temp_root.clone());
        let status = Arc::new(StatusPresenter::new(
            Arc::clone(&collaborators.channel),
            settings.status_min_interval,
            settings.status_loop_interval,
        ));
        let delivery = Arc::new(
            DeliveryClient::new(Arc::clone(&collaborators.channel), settings.limits)
                .with_rate_limit_retries(settings.upload_rate_limit_retries),
        );
        let pipeline = Arc::new(JobPipeline::new(
            PipelineCollaborators {
                downloader: collaborators.downloader,
                muxer: collaborators.muxer,
                prober: collaborators.prober,
                delivery,
                status: Arc::clone(&status),
            },
            temp.clone(),
            settings.limits,
        ));

        Ok(Self {
            policy: FormatPolicyEngine::new(settings.limits, settings.risk),
            extractor: collaborators.extractor,
            sessions: SessionCache::new(settings.session_ttl),
            rate_limiter: RateLimiter::new(settings.rate_limit),
            active_jobs: Arc::new(ActiveJobRegistry::new(settings.max_active_jobs_per_user)),
            queue: Arc::new(JobQueue::new(settings.queue)?),
            pool: WorkerPool::new(settings.pool),
            pipeline,
            temp,
            status,
        })
    }

    /// Prepare the temp root and start the workers.
    pub async fn start(&self) -> Result<()> {
        self.temp.start().await?;
        self.pool.start(
            Arc::clone(&self.queue),
            Arc::clone(&self.pipeline) as Arc<dyn crate::pipeline::JobHandler>,
        );
        info!(root = %self.temp.root().display(), "Courier service started");
        Ok(())
    }

    /// Stop accepting jobs, cancel live ones and release every resource.
    pub async fn shutdown(&self) {
        info!("Courier service shutting down");
        self.pool.stop(&self.queue).await;
        self.status.stop_all().await;
        self.temp.shutdown().await;
        info!("Courier service stopped");
    }

    /// Extract a link and offer its choices under a fresh session version.
    ///
    /// `platform` overrides host-based detection.
    pub async fn get_choices(
        &self,
        user: UserId,
        url: &str,
        platform: Option<Platform>,
    ) -> Result<ChoicesResult> {
        if !self.rate_limiter.allow(user) {
            return Err(Error::RateLimited);
        }
        let parsed = validate_url(url)?;
        let platform = match platform.or_else(|| Platform::detect(&parsed)) {
            Some(platform) => platform,
            None => {
                return Err(Error::UnsupportedPlatform(
                    parsed.host_str().unwrap_or_default().to_string(),
                ));
            }
        };

        let media = self.extractor.extract(parsed.as_str()).await?;
        let choices = self.policy.build_choices(platform.as_str(), &media.streams)?;
        let session_version =
            self.sessions
                .new_session(user, parsed.as_str(), platform, choices.clone());
        info!(
            user_id = user,
            platform = %platform,
            choices = choices.len(),
            session_version,
            "Choices offered"
        );
        Ok(ChoicesResult {
            title: media.title,
            choices,
            session_version,
        })
    }

    /// Admit a button press as a job.
    pub fn submit(&self, user: UserId, chat: ChatId, session_version: u64, choice_id: &str) -> SubmitResult {
        match self.try_submit(user, chat, session_version, choice_id) {
            Ok(result) => result,
            Err(e) => {
                match e.kind() {
                    ErrorKind::Internal => warn!(user_id = user, error = %e, "Submission failed"),
                    _ => debug!(user_id = user, error = %e, "Submission refused"),
                }
                SubmitResult::rejected(&e)
            }
        }
    }

    fn try_submit(&self, user: UserId, chat: ChatId, session_version: u64, choice_id: &str) -> Result<SubmitResult> {
        if !self.rate_limiter.allow(user) {
            return Err(Error::RateLimited);
        }
        let selection = self.sessions.resolve(user, session_version, choice_id)?;
        if selection.choice.availability == Availability::Unavailable {
            return Err(Error::ChoiceUnavailable);
        }
        validate_choice(&selection.choice)?;

        let slot = self
            .active_jobs
            .try_acquire_guard(user)
            .ok_or(Error::ActiveJobLimit)?;
        let job = Job::new(
            user,
            chat,
            selection.platform,
            selection.url,
            FormatChoice::clone(&selection.choice),
        );
        let job_id = job.id.clone();
        self.queue.enqueue(job, Some(slot))?;

        let warn_risky = selection.choice.availability == Availability::Risky
            && self
                .sessions
                .take_risk_warning(user, session_version)
                .unwrap_or(true);
        info!(
            job_id = %job_id,
            user_id = user,
            choice = %selection.choice.label,
            "Job accepted"
        );
        Ok(SubmitResult {
            accepted: true,
            message: if warn_risky {
                messages::RISKY_ACCEPTED
            } else {
                messages::ACCEPTED
            },
            job_id: Some(job_id),
        })
    }

    /// Cancel one job of the user, or all of them when `job_id` is `None`.
    pub fn cancel(&self, user: UserId, job_id: Option<&JobId>) -> CancelResult {
        let cancelled = match job_id {
            Some(id) => self.queue.cancel_owned(user, id),
            None => self.queue.cancel_user(user) > 0,
        };
        CancelResult {
            cancelled,
            message: if cancelled {
                messages::CANCELLED
            } else {
                messages::NOTHING_TO_CANCEL
            },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.pipeline.subscribe()
    }

    pub fn active_jobs(&self) -> &ActiveJobRegistry {
        &self.active_jobs
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn temp(&self) -> &TempAreaManager {
        &self.temp
    }
}
