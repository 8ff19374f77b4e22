//! Delivery to the chat: channel seam, upload strategy, status reporting.

pub mod channel;
pub mod client;
pub mod status;
pub mod telegram;

pub use channel::{ChannelError, ChannelResult, DeliveryChannel};
pub use client::{DeliveryClient, UploadMode};
pub use status::{StatusHandle, StatusPresenter};
pub use telegram::TelegramChannel;
