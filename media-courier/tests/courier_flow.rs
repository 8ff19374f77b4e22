//! End-to-end tests of the courier service with in-memory collaborators.
//!
//! The fakes write small files into the job's temp area so the real
//! pipeline, temp area manager and delivery client run unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use media_courier::admission::RateLimiterConfig;
use media_courier::delivery::{ChannelError, ChannelResult, DeliveryChannel};
use media_courier::domain::{
    AudioCodec, Availability, ChatId, Container, JobId, JobStage, MessageId, Platform,
    RawCandidateStream, VideoCodec,
};
use media_courier::media::{ExtractedMedia, Extractor, Muxer, ProbeReport, Prober, StreamDownloader};
use media_courier::messages;
use media_courier::pipeline::{JobEvent, JobQueueConfig};
use media_courier::services::{CourierCollaborators, CourierService, CourierSettings};
use media_courier::{Error, ErrorKind, Result};

const GB: u64 = 1_000_000_000;
const MB: u64 = 1_000_000;
const USER: i64 = 42;
const CHAT: i64 = 4200;
const LINK: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

fn video(id: &str, height: u32, size: u64) -> RawCandidateStream {
    RawCandidateStream {
        id: id.to_string(),
        is_video: true,
        height: Some(height),
        width: Some(height * 16 / 9),
        fps: Some(30.0),
        video_codec: Some(VideoCodec::H264),
        container_hint: Some("mp4".to_string()),
        size_bytes: Some(size),
        ..Default::default()
    }
}

fn audio(id: &str, size: u64) -> RawCandidateStream {
    RawCandidateStream {
        id: id.to_string(),
        is_audio: true,
        audio_codec: Some(AudioCodec::Aac),
        audio_bitrate_kbps: Some(128),
        container_hint: Some("m4a".to_string()),
        size_bytes: Some(size),
        ..Default::default()
    }
}

fn progressive(id: &str, height: u32, size: u64) -> RawCandidateStream {
    RawCandidateStream {
        is_audio: true,
        audio_codec: Some(AudioCodec::Aac),
        audio_bitrate_kbps: Some(96),
        ..video(id, height, size)
    }
}

/// 1080p over the safe limit, 720p well under it.
fn split_streams() -> Vec<RawCandidateStream> {
    vec![
        video("137", 1080, 2 * GB),
        video("136", 720, 500 * MB),
        audio("140", 10 * MB),
    ]
}

/// Where a fake tool should stop and wait for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Nowhere,
    Download,
    Merge,
}

/// How a download goes wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Error,
    Panic,
}

struct FakeTools {
    streams: Vec<RawCandidateStream>,
    block: Block,
    download_fault: Option<Fault>,
    drop_audio: bool,
    downloads: AtomicUsize,
    merges: AtomicUsize,
    remuxes: AtomicUsize,
}

impl FakeTools {
    fn new(streams: Vec<RawCandidateStream>) -> Self {
        Self {
            streams,
            block: Block::Nowhere,
            download_fault: None,
            drop_audio: false,
            downloads: AtomicUsize::new(0),
            merges: AtomicUsize::new(0),
            remuxes: AtomicUsize::new(0),
        }
    }

    fn blocking(mut self, block: Block) -> Self {
        self.block = block;
        self
    }

    fn failing_download(mut self, fault: Fault) -> Self {
        self.download_fault = Some(fault);
        self
    }

    fn without_audio(mut self) -> Self {
        self.drop_audio = true;
        self
    }
}

async fn write_file(path: &Path, len: usize) -> Result<()> {
    tokio::fs::write(path, vec![0u8; len]).await?;
    Ok(())
}

#[async_trait]
impl Extractor for FakeTools {
    async fn extract(&self, _url: &str) -> Result<ExtractedMedia> {
        Ok(ExtractedMedia {
            title: Some("Test clip".to_string()),
            duration_secs: Some(12.0),
            streams: self.streams.clone(),
        })
    }
}

#[async_trait]
impl StreamDownloader for FakeTools {
    async fn download(
        &self,
        _url: &str,
        stream_id: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        match self.download_fault {
            Some(Fault::Error) => return Err(Error::Download("HTTP Error 403: Forbidden".to_string())),
            Some(Fault::Panic) => panic!("downloader exploded"),
            None => {}
        }
        let ext = if stream_id == "140" { "m4a" } else { "mp4" };
        let path = destination.with_extension(ext);
        write_file(&path, 2048).await?;
        if self.block == Block::Download {
            cancel.cancelled().await;
            return Err(Error::Cancelled);
        }
        Ok(path)
    }
}

#[async_trait]
impl Muxer for FakeTools {
    async fn merge(
        &self,
        _video: &Path,
        _audio: &Path,
        destination: &Path,
        _container: Container,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        write_file(destination, 4096).await?;
        if self.block == Block::Merge {
            cancel.cancelled().await;
            return Err(Error::Cancelled);
        }
        Ok(destination.to_path_buf())
    }

    async fn remux(
        &self,
        _input: &Path,
        destination: &Path,
        _container: Container,
        _cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.remuxes.fetch_add(1, Ordering::SeqCst);
        write_file(destination, 4096).await?;
        Ok(destination.to_path_buf())
    }
}

#[async_trait]
impl Prober for FakeTools {
    async fn probe(&self, path: &Path) -> Result<ProbeReport> {
        let size_bytes = tokio::fs::metadata(path).await?.len();
        let format_name = match path.extension().and_then(|e| e.to_str()) {
            Some("mkv") => "matroska,webm",
            _ => "mov,mp4,m4a,3gp,3g2,mj2",
        };
        Ok(ProbeReport {
            has_video: true,
            has_audio: !self.drop_audio,
            duration_secs: Some(12.0),
            format_name: Some(format_name.to_string()),
            size_bytes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Upload {
    Video(String),
    Document(String),
}

#[derive(Default)]
struct FakeChannel {
    next_id: AtomicI64,
    edits: Mutex<Vec<String>>,
    deleted: Mutex<Vec<MessageId>>,
    uploads: Mutex<Vec<Upload>>,
    upload_attempts: AtomicUsize,
    upload_delay: Duration,
    upload_error: Option<ChannelError>,
}

impl FakeChannel {
    /// Every upload waits `delay`, then fails with `error`.
    fn failing_uploads(error: ChannelError, delay: Duration) -> Self {
        Self {
            upload_delay: delay,
            upload_error: Some(error),
            ..Default::default()
        }
    }

    async fn upload(&self, upload: Upload) -> ChannelResult<()> {
        self.upload_attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.upload_delay).await;
        if let Some(error) = &self.upload_error {
            return Err(error.clone());
        }
        self.uploads.lock().push(upload);
        Ok(())
    }

    fn last_edit(&self) -> Option<String> {
        self.edits.lock().last().cloned()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl DeliveryChannel for FakeChannel {
    async fn send_status(&self, _chat: ChatId, _text: &str) -> ChannelResult<MessageId> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn edit_status(&self, _chat: ChatId, _message: MessageId, text: &str) -> ChannelResult<()> {
        self.edits.lock().push(text.to_string());
        Ok(())
    }

    async fn delete_status(&self, _chat: ChatId, message: MessageId) -> ChannelResult<()> {
        self.deleted.lock().push(message);
        Ok(())
    }

    async fn upload_video(&self, _chat: ChatId, path: &Path) -> ChannelResult<()> {
        self.upload(Upload::Video(file_name(path))).await
    }

    async fn upload_document(&self, _chat: ChatId, path: &Path) -> ChannelResult<()> {
        self.upload(Upload::Document(file_name(path))).await
    }
}

struct Harness {
    service: CourierService,
    tools: Arc<FakeTools>,
    channel: Arc<FakeChannel>,
    events: broadcast::Receiver<JobEvent>,
    root: PathBuf,
    _dir: tempfile::TempDir,
}

fn settings(root: &Path) -> CourierSettings {
    let mut settings = CourierSettings::new(root);
    settings.rate_limit = RateLimiterConfig {
        limit: 100,
        window: Duration::from_secs(10),
    };
    settings.status_min_interval = Duration::from_millis(5);
    settings.status_loop_interval = Duration::from_millis(20);
    settings
}

fn harness_with(tools: FakeTools, tune: impl FnOnce(&mut CourierSettings)) -> Harness {
    harness_full(tools, FakeChannel::default(), tune)
}

fn harness_full(
    tools: FakeTools,
    channel: FakeChannel,
    tune: impl FnOnce(&mut CourierSettings),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("jobs");
    let mut settings = settings(&root);
    tune(&mut settings);

    let tools = Arc::new(tools);
    let channel = Arc::new(channel);
    let service = CourierService::new(
        CourierCollaborators {
            extractor: tools.clone(),
            downloader: tools.clone(),
            muxer: tools.clone(),
            prober: tools.clone(),
            channel: channel.clone(),
        },
        settings,
    )
    .unwrap();
    let events = service.subscribe();
    Harness {
        service,
        tools,
        channel,
        events,
        root,
        _dir: dir,
    }
}

fn harness(tools: FakeTools) -> Harness {
    harness_with(tools, |_| {})
}

impl Harness {
    async fn wait_for(&mut self, mut accept: impl FnMut(&JobEvent) -> bool) -> JobEvent {
        let events = &mut self.events;
        timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(event) if accept(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event stream closed: {e}"),
                }
            }
        })
        .await
        .expect("timed out waiting for job event")
    }

    async fn wait_finished(&mut self, id: &JobId) -> (JobStage, Option<String>) {
        match self
            .wait_for(|e| matches!(e, JobEvent::Finished { job_id, .. } if job_id == id))
            .await
        {
            JobEvent::Finished { stage, error, .. } => (stage, error),
            other => unreachable!("unexpected event {other:?}"),
        }
    }

    async fn wait_stage(&mut self, id: &JobId, target: JobStage) {
        self.wait_for(
            |e| matches!(e, JobEvent::StageChanged { job_id, stage, .. } if job_id == id && *stage == target),
        )
        .await;
    }

    /// Start the service and submit the 720p choice of [`LINK`].
    async fn submit_720p(&mut self) -> JobId {
        self.service.start().await.unwrap();
        let offer = self.service.get_choices(USER, LINK, None).await.unwrap();
        self.service
            .submit(USER, CHAT, offer.session_version, &offer.choices[1].choice_id)
            .job_id
            .unwrap()
    }

    fn root_entries(&self) -> usize {
        std::fs::read_dir(&self.root).map(|d| d.count()).unwrap_or(0)
    }

    fn assert_released(&self, user: i64) {
        assert_eq!(self.service.active_jobs().active(user), 0);
        assert_eq!(self.service.active_jobs().violations(), 0);
        assert_eq!(self.service.temp().allocated_count(), 0);
        assert_eq!(self.root_entries(), 0);
    }
}

mod choices {
    use super::*;

    #[tokio::test]
    async fn test_risky_and_guaranteed_offered() {
        let h = harness(FakeTools::new(split_streams()));

        let result = h.service.get_choices(USER, LINK, None).await.unwrap();
        assert_eq!(result.title.as_deref(), Some("Test clip"));
        assert_eq!(result.choices.len(), 2);
        assert_eq!(result.choices[0].height, 1080);
        assert_eq!(result.choices[0].availability, Availability::Risky);
        assert_eq!(result.choices[1].height, 720);
        assert_eq!(result.choices[1].availability, Availability::Guaranteed);
        assert_eq!(h.service.sessions().current_version(USER), Some(result.session_version));
    }

    #[tokio::test]
    async fn test_link_refusals() {
        let h = harness(FakeTools::new(split_streams()));

        let err = h.service.get_choices(USER, "ftp://youtube.com/x", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserInput);
        assert_eq!(err.user_message(), messages::BAD_LINK);

        let err = h
            .service
            .get_choices(USER, "https://example.com/clip", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlatform(_)));

        let ok = h
            .service
            .get_choices(USER, "https://example.com/clip", Some(Platform::Vk))
            .await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let h = harness_with(FakeTools::new(split_streams()), |s| {
            s.rate_limit = RateLimiterConfig {
                limit: 2,
                window: Duration::from_secs(60),
            };
        });

        assert!(h.service.get_choices(USER, LINK, None).await.is_ok());
        assert!(h.service.get_choices(USER, LINK, None).await.is_ok());
        let err = h.service.get_choices(USER, LINK, None).await.unwrap_err();
        assert!(matches!(err, Error::RateLimited));
        assert!(h.service.get_choices(USER + 1, LINK, None).await.is_ok());
    }
}

mod admission {
    use super::*;

    #[tokio::test]
    async fn test_stale_session_refused() {
        let h = harness(FakeTools::new(split_streams()));

        let first = h.service.get_choices(USER, LINK, None).await.unwrap();
        let second = h.service.get_choices(USER, LINK, None).await.unwrap();
        assert!(second.session_version > first.session_version);

        let stale = h
            .service
            .submit(USER, CHAT, first.session_version, &first.choices[1].choice_id);
        assert!(!stale.accepted);
        assert_eq!(stale.message, messages::SESSION_EXPIRED);
        assert_eq!(h.service.queue().live_count(), 0);
        assert_eq!(h.service.active_jobs().active(USER), 0);
    }

    #[tokio::test]
    async fn test_unknown_choice_refused() {
        let h = harness(FakeTools::new(split_streams()));
        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();

        let result = h.service.submit(USER, CHAT, offer.session_version, "ffffffffffffffff");
        assert!(!result.accepted);
        assert_eq!(result.message, messages::SESSION_EXPIRED);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_other_user() {
        let h = harness_with(FakeTools::new(split_streams()), |s| {
            s.queue = JobQueueConfig { capacity: 1 };
        });
        let first = h.service.get_choices(USER, LINK, None).await.unwrap();
        let second = h.service.get_choices(USER + 1, LINK, None).await.unwrap();

        let accepted = h
            .service
            .submit(USER, CHAT, first.session_version, &first.choices[1].choice_id);
        assert!(accepted.accepted);
        assert_eq!(accepted.message, messages::ACCEPTED);

        let busy = h
            .service
            .submit(USER + 1, CHAT + 1, second.session_version, &second.choices[1].choice_id);
        assert!(!busy.accepted);
        assert_eq!(busy.message, messages::QUEUE_BUSY);
        assert_eq!(h.service.active_jobs().active(USER + 1), 0);
        assert_eq!(h.service.queue().queued_len(), 1);
    }

    #[tokio::test]
    async fn test_one_active_job_per_user() {
        let h = harness(FakeTools::new(split_streams()));
        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        let choice = &offer.choices[1].choice_id;

        assert!(h.service.submit(USER, CHAT, offer.session_version, choice).accepted);
        let second = h.service.submit(USER, CHAT, offer.session_version, choice);
        assert!(!second.accepted);
        assert_eq!(second.message, messages::ALREADY_ACTIVE_JOB);
        assert_eq!(h.service.active_jobs().active(USER), 1);
        assert_eq!(h.service.queue().live_count(), 1);
    }

    #[tokio::test]
    async fn test_nothing_to_cancel() {
        let h = harness(FakeTools::new(split_streams()));
        let result = h.service.cancel(USER, None);
        assert!(!result.cancelled);
        assert_eq!(result.message, messages::NOTHING_TO_CANCEL);
    }
}

mod execution {
    use super::*;

    #[tokio::test]
    async fn test_split_streams_delivered_as_video() {
        let mut h = harness(FakeTools::new(split_streams()));
        h.service.start().await.unwrap();

        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        let submit = h
            .service
            .submit(USER, CHAT, offer.session_version, &offer.choices[1].choice_id);
        let job_id = submit.job_id.unwrap();

        let (stage, error) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Done);
        assert_eq!(error, None);
        assert_eq!(h.tools.downloads.load(Ordering::SeqCst), 2);
        assert_eq!(h.tools.merges.load(Ordering::SeqCst), 1);
        assert_eq!(
            *h.channel.uploads.lock(),
            vec![Upload::Video("youtube_720p.mp4".to_string())]
        );
        assert_eq!(h.channel.last_edit().as_deref(), Some(messages::STATUS_DONE));
        h.assert_released(USER);

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_progressive_stream_is_remuxed() {
        let mut h = harness(FakeTools::new(vec![progressive("18", 360, 20 * MB)]));
        h.service.start().await.unwrap();

        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        assert_eq!(offer.choices.len(), 1);
        let job_id = h
            .service
            .submit(USER, CHAT, offer.session_version, &offer.choices[0].choice_id)
            .job_id
            .unwrap();

        let (stage, _) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Done);
        assert_eq!(h.tools.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(h.tools.remuxes.load(Ordering::SeqCst), 1);
        assert_eq!(h.tools.merges.load(Ordering::SeqCst), 0);
        h.assert_released(USER);

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_risk_warning_shown_once_per_session() {
        let mut h = harness(FakeTools::new(split_streams()));
        h.service.start().await.unwrap();

        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        let risky = &offer.choices[0].choice_id;

        let first = h.service.submit(USER, CHAT, offer.session_version, risky);
        assert_eq!(first.message, messages::RISKY_ACCEPTED);
        h.wait_finished(first.job_id.as_ref().unwrap()).await;

        let second = h.service.submit(USER, CHAT, offer.session_version, risky);
        assert!(second.accepted);
        assert_eq!(second.message, messages::ACCEPTED);
        h.wait_finished(second.job_id.as_ref().unwrap()).await;

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_artifact_fails_job() {
        let mut h = harness(FakeTools::new(split_streams()).without_audio());
        h.service.start().await.unwrap();

        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        let job_id = h
            .service
            .submit(USER, CHAT, offer.session_version, &offer.choices[1].choice_id)
            .job_id
            .unwrap();

        let (stage, error) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Failed);
        assert!(error.is_some());
        assert!(h.channel.uploads.lock().is_empty());
        assert_eq!(h.channel.last_edit().as_deref(), Some(messages::TRY_ANOTHER_FORMAT));
        h.assert_released(USER);

        h.service.shutdown().await;
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_cancel_while_queued_never_runs() {
        let mut h = harness(FakeTools::new(split_streams()));

        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        let job_id = h
            .service
            .submit(USER, CHAT, offer.session_version, &offer.choices[1].choice_id)
            .job_id
            .unwrap();
        let result = h.service.cancel(USER, None);
        assert!(result.cancelled);
        assert_eq!(result.message, messages::CANCELLED);

        h.service.start().await.unwrap();
        let (stage, _) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Cancelled);
        assert_eq!(h.tools.downloads.load(Ordering::SeqCst), 0);
        assert!(h.channel.uploads.lock().is_empty());
        h.assert_released(USER);

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_during_merge_cleans_up() {
        let mut h = harness(FakeTools::new(split_streams()).blocking(Block::Merge));
        h.service.start().await.unwrap();

        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        let job_id = h
            .service
            .submit(USER, CHAT, offer.session_version, &offer.choices[1].choice_id)
            .job_id
            .unwrap();
        h.wait_stage(&job_id, JobStage::Merging).await;

        // Another user's cancel must not touch the job.
        assert!(!h.service.cancel(USER + 1, Some(&job_id)).cancelled);
        assert!(h.service.cancel(USER, Some(&job_id)).cancelled);

        let (stage, error) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Cancelled);
        assert_eq!(error, None);
        assert!(h.channel.uploads.lock().is_empty());
        assert_eq!(h.channel.deleted.lock().len(), 1);
        h.assert_released(USER);

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_job() {
        let mut h = harness(FakeTools::new(split_streams()).blocking(Block::Download));
        h.service.start().await.unwrap();

        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        let job_id = h
            .service
            .submit(USER, CHAT, offer.session_version, &offer.choices[1].choice_id)
            .job_id
            .unwrap();
        h.wait_stage(&job_id, JobStage::Downloading).await;

        h.service.shutdown().await;
        let (stage, _) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Cancelled);
        assert_eq!(h.service.active_jobs().active(USER), 0);
        assert_eq!(h.service.temp().allocated_count(), 0);

        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        let after = h
            .service
            .submit(USER, CHAT, offer.session_version, &offer.choices[1].choice_id);
        assert!(!after.accepted);
        assert_eq!(after.message, messages::QUEUE_BUSY);
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_download_error_fails_job() {
        let mut h = harness(FakeTools::new(split_streams()).failing_download(Fault::Error));
        let job_id = h.submit_720p().await;

        let (stage, error) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Failed);
        assert!(error.unwrap().contains("403"));
        assert_eq!(h.tools.merges.load(Ordering::SeqCst), 0);
        assert_eq!(h.channel.last_edit().as_deref(), Some(messages::TRY_ANOTHER_FORMAT));
        assert_eq!(h.channel.upload_attempts.load(Ordering::SeqCst), 0);
        h.assert_released(USER);

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_job_fails_and_worker_survives() {
        let mut h = harness(FakeTools::new(split_streams()).failing_download(Fault::Panic));
        let first = h.submit_720p().await;

        let (stage, error) = h.wait_finished(&first).await;
        assert_eq!(stage, JobStage::Failed);
        assert!(error.unwrap().contains("downloader exploded"));
        assert_eq!(h.channel.last_edit().as_deref(), Some(messages::TRY_LATER));
        h.assert_released(USER);

        // The worker keeps serving jobs.
        let offer = h.service.get_choices(USER, LINK, None).await.unwrap();
        let second = h
            .service
            .submit(USER, CHAT, offer.session_version, &offer.choices[1].choice_id)
            .job_id
            .unwrap();
        let (stage, _) = h.wait_finished(&second).await;
        assert_eq!(stage, JobStage::Failed);

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_upload_tries_document_then_fails() {
        let channel = FakeChannel::failing_uploads(
            ChannelError::Rejected("Bad Request: file is too big".to_string()),
            Duration::ZERO,
        );
        let mut h = harness_full(FakeTools::new(split_streams()), channel, |_| {});
        let job_id = h.submit_720p().await;

        let (stage, _) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Failed);
        assert_eq!(h.channel.upload_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.channel.last_edit().as_deref(), Some(messages::SEND_FAILED));
        h.assert_released(USER);

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_network_error_reports_uncertain_delivery() {
        let channel = FakeChannel::failing_uploads(
            ChannelError::Network("connection reset".to_string()),
            Duration::ZERO,
        );
        let mut h = harness_full(FakeTools::new(split_streams()), channel, |_| {});
        let job_id = h.submit_720p().await;

        let (stage, _) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Failed);
        // Never retried: the first upload may have landed.
        assert_eq!(h.channel.upload_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(h.channel.last_edit().as_deref(), Some(messages::DELIVERY_UNCERTAIN));
        h.assert_released(USER);

        h.service.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_during_upload_keeps_uncertain_outcome() {
        let channel = FakeChannel::failing_uploads(
            ChannelError::Network("connection reset".to_string()),
            Duration::from_millis(300),
        );
        let mut h = harness_full(FakeTools::new(split_streams()), channel, |_| {});
        let job_id = h.submit_720p().await;
        h.wait_stage(&job_id, JobStage::Sending).await;

        timeout(Duration::from_secs(5), async {
            while h.channel.upload_attempts.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("upload never started");
        assert!(h.service.cancel(USER, Some(&job_id)).cancelled);

        let (stage, error) = h.wait_finished(&job_id).await;
        assert_eq!(stage, JobStage::Failed);
        assert!(error.is_some());
        assert!(h.channel.deleted.lock().is_empty());
        assert_eq!(h.channel.last_edit().as_deref(), Some(messages::DELIVERY_UNCERTAIN));
        h.assert_released(USER);

        h.service.shutdown().await;
    }
}
