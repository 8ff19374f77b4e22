//! Tiered upload strategy on top of a [`DeliveryChannel`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::channel::{ChannelError, ChannelResult, DeliveryChannel};
use crate::domain::ChatId;
use crate::policy::ChannelLimits;
use crate::storage::fs::file_size;
use crate::{Error, Result};

/// How the artifact ended up being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Video,
    Document,
}

impl UploadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Document => "document",
        }
    }
}

pub struct DeliveryClient {
    channel: Arc<dyn DeliveryChannel>,
    limits: ChannelLimits,
    max_rate_limit_retries: u32,
    max_retry_after: Duration,
}

impl DeliveryClient {
    pub fn new(channel: Arc<dyn DeliveryChannel>, limits: ChannelLimits) -> Self {
        Self {
            channel,
            limits,
            max_rate_limit_retries: 3,
            max_retry_after: Duration::from_secs(60),
        }
    }

    pub fn with_rate_limit_retries(mut self, retries: u32) -> Self {
        self.max_rate_limit_retries = retries;
        self
    }

    /// Deliver a file to a chat.
    ///
    /// Small files go as video first and fall back to a document only when
    /// the channel rejects the video. Files at or above the document-only
    /// threshold go as documents. Files above the hard limit are refused
    /// without uploading. Network failures are never retried.
    pub async fn deliver(&self, chat: ChatId, path: &Path, cancel: &CancellationToken) -> Result<UploadMode> {
        let size = match file_size(path).await? {
            Some(size) if size > 0 => size,
            _ => return Err(Error::InvalidArtifact("file is missing or empty".to_string())),
        };
        if size > self.limits.hard_bytes {
            return Err(Error::DeliveryRejected(format!(
                "file of {size} bytes exceeds the channel limit"
            )));
        }

        if size >= self.limits.document_only_bytes {
            self.attempt(UploadMode::Document, chat, path, cancel)
                .await
                .map_err(into_error)?;
            info!(chat_id = chat, size, mode = "document", "Delivered");
            return Ok(UploadMode::Document);
        }

        match self.attempt(UploadMode::Video, chat, path, cancel).await {
            Ok(()) => {
                info!(chat_id = chat, size, mode = "video", "Delivered");
                Ok(UploadMode::Video)
            }
            Err(Attempt::Channel(ChannelError::Rejected(reason))) => {
                warn!(chat_id = chat, %reason, "Video upload rejected, sending as document");
                self.attempt(UploadMode::Document, chat, path, cancel)
                    .await
                    .map_err(into_error)?;
                info!(chat_id = chat, size, mode = "document", "Delivered");
                Ok(UploadMode::Document)
            }
            Err(other) => Err(into_error(other)),
        }
    }

    /// One upload, repeated only while the channel answers "retry after".
    async fn attempt(
        &self,
        mode: UploadMode,
        chat: ChatId,
        path: &Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Attempt> {
        let mut retries = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Attempt::Cancelled);
            }
            let result: ChannelResult<()> = match mode {
                UploadMode::Video => self.channel.upload_video(chat, path).await,
                UploadMode::Document => self.channel.upload_document(chat, path).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(ChannelError::RateLimited { retry_after }) if retries < self.max_rate_limit_retries => {
                    retries += 1;
                    let wait = retry_after.min(self.max_retry_after);
                    warn!(
                        chat_id = chat,
                        mode = mode.as_str(),
                        wait = ?wait,
                        attempt = retries,
                        "Upload rate limited, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Attempt::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Err(Attempt::Channel(e)),
            }
        }
    }
}

enum Attempt {
    Channel(ChannelError),
    Cancelled,
}

fn into_error(attempt: Attempt) -> Error {
    match attempt {
        Attempt::Cancelled => Error::Cancelled,
        Attempt::Channel(ChannelError::Rejected(reason)) => Error::DeliveryRejected(reason),
        Attempt::Channel(ChannelError::Network(reason)) => Error::DeliveryUncertain(reason),
        Attempt::Channel(ChannelError::RateLimited { retry_after }) => Error::Channel(format!(
            "still rate limited, retry after {}s",
            retry_after.as_secs()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedChannel {
        video: Mutex<VecDeque<ChannelResult<()>>>,
        document: Mutex<VecDeque<ChannelResult<()>>>,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl DeliveryChannel for ScriptedChannel {
        async fn send_status(&self, _chat: ChatId, _text: &str) -> ChannelResult<MessageId> {
            Ok(1)
        }
        async fn edit_status(&self, _: ChatId, _: MessageId, _: &str) -> ChannelResult<()> {
            Ok(())
        }
        async fn delete_status(&self, _: ChatId, _: MessageId) -> ChannelResult<()> {
            Ok(())
        }
        async fn upload_video(&self, _: ChatId, _: &Path) -> ChannelResult<()> {
            self.calls.lock().push("video");
            self.video.lock().pop_front().unwrap_or(Ok(()))
        }
        async fn upload_document(&self, _: ChatId, _: &Path) -> ChannelResult<()> {
            self.calls.lock().push("document");
            self.document.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn limits() -> ChannelLimits {
        ChannelLimits {
            hard_bytes: 1000,
            safe_bytes: 500,
            risky_bytes: 800,
            document_only_bytes: 100,
        }
    }

    async fn file_of(size: usize) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mp4");
        tokio::fs::write(&path, vec![0u8; size]).await.unwrap();
        (dir, path)
    }

    fn client(channel: &Arc<ScriptedChannel>) -> DeliveryClient {
        DeliveryClient::new(channel.clone() as Arc<dyn DeliveryChannel>, limits())
    }

    #[tokio::test]
    async fn test_small_file_goes_as_video() {
        let (_dir, path) = file_of(10).await;
        let channel = Arc::new(ScriptedChannel::default());
        let mode = client(&channel).deliver(1, &path, &CancellationToken::new()).await.unwrap();
        assert_eq!(mode, UploadMode::Video);
        assert_eq!(*channel.calls.lock(), vec!["video"]);
    }

    #[tokio::test]
    async fn test_rejected_video_falls_back_to_document() {
        let (_dir, path) = file_of(10).await;
        let channel = Arc::new(ScriptedChannel::default());
        channel.video.lock().push_back(Err(ChannelError::Rejected("bad video".into())));
        let mode = client(&channel).deliver(1, &path, &CancellationToken::new()).await.unwrap();
        assert_eq!(mode, UploadMode::Document);
        assert_eq!(*channel.calls.lock(), vec!["video", "document"]);
    }

    #[tokio::test]
    async fn test_network_error_not_retried() {
        let (_dir, path) = file_of(10).await;
        let channel = Arc::new(ScriptedChannel::default());
        channel.video.lock().push_back(Err(ChannelError::Network("reset".into())));
        let err = client(&channel).deliver(1, &path, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::DeliveryUncertain(_)));
        assert_eq!(*channel.calls.lock(), vec!["video"]);
    }

    #[tokio::test]
    async fn test_large_file_document_only() {
        let (_dir, path) = file_of(200).await;
        let channel = Arc::new(ScriptedChannel::default());
        let mode = client(&channel).deliver(1, &path, &CancellationToken::new()).await.unwrap();
        assert_eq!(mode, UploadMode::Document);
        assert_eq!(*channel.calls.lock(), vec!["document"]);
    }

    #[tokio::test]
    async fn test_over_hard_limit_refused_before_upload() {
        let (_dir, path) = file_of(1001).await;
        let channel = Arc::new(ScriptedChannel::default());
        let err = client(&channel).deliver(1, &path, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::DeliveryRejected(_)));
        assert!(channel.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retried_bounded() {
        let (_dir, path) = file_of(200).await;
        let channel = Arc::new(ScriptedChannel::default());
        for _ in 0..2 {
            channel.document.lock().push_back(Err(ChannelError::RateLimited {
                retry_after: Duration::from_secs(3),
            }));
        }
        let mode = client(&channel).deliver(1, &path, &CancellationToken::new()).await.unwrap();
        assert_eq!(mode, UploadMode::Document);
        assert_eq!(channel.calls.lock().len(), 3);

        let channel = Arc::new(ScriptedChannel::default());
        for _ in 0..10 {
            channel.document.lock().push_back(Err(ChannelError::RateLimited {
                retry_after: Duration::from_secs(1),
            }));
        }
        let err = client(&channel)
            .with_rate_limit_retries(2)
            .deliver(1, &path, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
        assert_eq!(channel.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_during_rate_limit_wait() {
        let (_dir, path) = file_of(200).await;
        let channel = Arc::new(ScriptedChannel::default());
        channel.document.lock().push_back(Err(ChannelError::RateLimited {
            retry_after: Duration::from_secs(30),
        }));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = client(&channel).deliver(1, &path, &token).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
