//! Chat delivery channel seam.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ChatId, MessageId};

/// Outcome classes of a failed channel request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel definitively refused the request.
    #[error("rejected by channel: {0}")]
    Rejected(String),

    /// The request was not accepted; it may be repeated after the delay.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Transport failure or timeout. The request may or may not have landed.
    #[error("network error: {0}")]
    Network(String),
}

impl ChannelError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Post a status message and return its id.
    async fn send_status(&self, chat: ChatId, text: &str) -> ChannelResult<MessageId>;

    async fn edit_status(&self, chat: ChatId, message: MessageId, text: &str) -> ChannelResult<()>;

    async fn delete_status(&self, chat: ChatId, message: MessageId) -> ChannelResult<()>;

    /// Upload as a playable video. Stricter than a document upload.
    async fn upload_video(&self, chat: ChatId, path: &Path) -> ChannelResult<()>;

    async fn upload_document(&self, chat: ChatId, path: &Path) -> ChannelResult<()>;
}
