//! Service container: builds the concrete adapters from configuration and
//! owns their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::courier::{CourierCollaborators, CourierService, CourierSettings};
use crate::Result;
use crate::config::AppConfig;
use crate::delivery::{DeliveryChannel, TelegramChannel};
use crate::media::{FfmpegMuxer, FfprobeProber, YtDlpDownloader, YtDlpExtractor};

pub struct ServiceContainer {
    pub courier: Arc<CourierService>,
    pub telegram: Arc<TelegramChannel>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    pub fn new(config: &AppConfig) -> Result<Self> {
        info!("Initializing service container");
        let tools = &config.tools;
        let grace = tools.grace();

        let telegram = Arc::new(TelegramChannel::new(&config.telegram)?);
        let extractor = YtDlpExtractor::new(
            &tools.ytdlp_path,
            Duration::from_secs(tools.extract_timeout_secs),
            grace,
        )
        .with_socket_timeout(Duration::from_secs(tools.socket_timeout_secs));
        let mut downloader =
            YtDlpDownloader::new(&tools.ytdlp_path, grace).with_retries(tools.download_retries);
        if tools.download_timeout_secs > 0 {
            downloader = downloader.with_timeout(Duration::from_secs(tools.download_timeout_secs));
        }
        let muxer = FfmpegMuxer::new(
            &tools.ffmpeg_path,
            Duration::from_secs(tools.merge_timeout_secs),
            grace,
        );
        let prober = FfprobeProber::new(
            &tools.ffprobe_path,
            Duration::from_secs(tools.probe_timeout_secs),
            grace,
        );

        let courier = CourierService::new(
            CourierCollaborators {
                extractor: Arc::new(extractor),
                downloader: Arc::new(downloader),
                muxer: Arc::new(muxer),
                prober: Arc::new(prober),
                channel: Arc::clone(&telegram) as Arc<dyn DeliveryChannel>,
            },
            CourierSettings::from_config(config),
        )?;

        info!("Service container initialized");
        Ok(Self {
            courier: Arc::new(courier),
            telegram,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Token cancelled by [`ServiceContainer::shutdown`]; background tasks
    /// watch it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub async fn start(&self) -> Result<()> {
        self.courier.start().await
    }

    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.courier.shutdown().await;
    }
}
