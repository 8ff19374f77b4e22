//! Telegram Bot API channel.
//!
//! Every call is a single attempt. HTTP 429 maps to
//! [`ChannelError::RateLimited`] with the server's `parameters.retry_after`,
//! other 4xx responses to [`ChannelError::Rejected`], and transport failures
//! or 5xx to [`ChannelError::Network`]. Retrying is the caller's decision.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tracing::{debug, trace, warn};

use super::channel::{ChannelError, ChannelResult, DeliveryChannel};
use crate::config::TelegramConfig;
use crate::domain::{ChatId, MessageId, UserId};

/// Telegram `sendMessage` text limit (characters).
const MESSAGE_LIMIT: usize = 4096;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

/// One inline keyboard button: visible text and callback data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Map a failed response to a channel error.
fn classify_failure(status: StatusCode, description: Option<String>, retry_after: Option<u64>) -> ChannelError {
    let description = description.unwrap_or_else(|| status.to_string());
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ChannelError::RateLimited {
            retry_after: Duration::from_secs(retry_after.unwrap_or(1)),
        };
    }
    if status.is_client_error() {
        return ChannelError::Rejected(description);
    }
    ChannelError::Network(format!("{status}: {description}"))
}

fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MESSAGE_LIMIT {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(MESSAGE_LIMIT - 1).collect();
    truncated.push('\u{2026}');
    truncated
}

pub struct TelegramChannel {
    client: Client,
    api_base: String,
    request_timeout: Duration,
    upload_timeout: Duration,
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig) -> crate::Result<Self> {
        install_rustls_provider();
        if config.bot_token.trim().is_empty() {
            return Err(crate::Error::config("telegram bot token is empty"));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| crate::Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base: format!(
                "{}/bot{}",
                config.api_base_url.trim_end_matches('/'),
                config.bot_token
            ),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            upload_timeout: Duration::from_secs(config.upload_timeout_secs),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> ChannelResult<T> {
        let status = response.status();
        let body: ApiResponse<T> = match response.json().await {
            Ok(body) => body,
            Err(e) if status.is_success() => {
                return Err(ChannelError::Network(format!("unreadable response: {e}")));
            }
            Err(_) => return Err(classify_failure(status, None, None)),
        };
        if status.is_success() && body.ok {
            return body
                .result
                .ok_or_else(|| ChannelError::Network("response without result".to_string()));
        }
        let retry_after = body.parameters.and_then(|p| p.retry_after);
        let status = if status.is_success() {
            StatusCode::BAD_REQUEST
        } else {
            status
        };
        Err(classify_failure(status, body.description, retry_after))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        payload: &Value,
        timeout: Duration,
    ) -> ChannelResult<T> {
        trace!(method, "Telegram request");
        let response = self
            .client
            .post(self.method_url(method))
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ChannelError::Network(e.to_string()))?;
        Self::parse_response(response).await
    }

    async fn upload(
        &self,
        method: &'static str,
        field: &'static str,
        chat: ChatId,
        path: &Path,
    ) -> ChannelResult<()> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ChannelError::Rejected(format!("cannot open {}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| ChannelError::Rejected(format!("cannot stat {}: {e}", path.display())))?
            .len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, len).file_name(file_name);
        let mut form = Form::new().text("chat_id", chat.to_string()).part(field, part);
        if method == "sendVideo" {
            form = form.text("supports_streaming", "true");
        }

        debug!(method, chat_id = chat, size = len, "Uploading file");
        let response = self
            .client
            .post(self.method_url(method))
            .multipart(form)
            .timeout(self.upload_timeout)
            .send()
            .await
            .map_err(|e| ChannelError::Network(e.to_string()))?;
        Self::parse_response::<Value>(response).await.map(|_| ())
    }

    /// Long-poll for updates.
    pub async fn get_updates(&self, offset: i64, poll_timeout: Duration) -> ChannelResult<Vec<Update>> {
        let payload = json!({
            "offset": offset,
            "timeout": poll_timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        self.call("getUpdates", &payload, poll_timeout + self.request_timeout)
            .await
    }

    pub async fn send_text(&self, chat: ChatId, text: &str) -> ChannelResult<MessageId> {
        let payload = json!({ "chat_id": chat, "text": truncate_message(text) });
        let message: Message = self.call("sendMessage", &payload, self.request_timeout).await?;
        Ok(message.message_id)
    }

    /// Send a message with an inline keyboard, one button per row.
    pub async fn send_keyboard(
        &self,
        chat: ChatId,
        text: &str,
        buttons: &[InlineButton],
    ) -> ChannelResult<MessageId> {
        let rows: Vec<Value> = buttons
            .iter()
            .map(|b| json!([{ "text": b.text, "callback_data": b.callback_data }]))
            .collect();
        let payload = json!({
            "chat_id": chat,
            "text": truncate_message(text),
            "reply_markup": { "inline_keyboard": rows },
        });
        let message: Message = self.call("sendMessage", &payload, self.request_timeout).await?;
        Ok(message.message_id)
    }

    pub async fn answer_callback(&self, callback_id: &str, text: Option<&str>) -> ChannelResult<()> {
        let mut payload = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            payload["text"] = Value::String(text.to_string());
        }
        self.call::<Value>("answerCallbackQuery", &payload, self.request_timeout)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl DeliveryChannel for TelegramChannel {
    async fn send_status(&self, chat: ChatId, text: &str) -> ChannelResult<MessageId> {
        self.send_text(chat, text).await
    }

    async fn edit_status(&self, chat: ChatId, message: MessageId, text: &str) -> ChannelResult<()> {
        let payload = json!({
            "chat_id": chat,
            "message_id": message,
            "text": truncate_message(text),
        });
        match self
            .call::<Value>("editMessageText", &payload, self.request_timeout)
            .await
        {
            Ok(_) => Ok(()),
            Err(ChannelError::Rejected(d)) if d.contains("message is not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_status(&self, chat: ChatId, message: MessageId) -> ChannelResult<()> {
        let payload = json!({ "chat_id": chat, "message_id": message });
        match self
            .call::<Value>("deleteMessage", &payload, self.request_timeout)
            .await
        {
            Ok(_) => Ok(()),
            Err(ChannelError::Rejected(d)) if d.contains("message to delete not found") => {
                warn!(chat_id = chat, message_id = message, "Status message already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn upload_video(&self, chat: ChatId, path: &Path) -> ChannelResult<()> {
        self.upload("sendVideo", "video", chat, path).await
    }

    async fn upload_document(&self, chat: ChatId, path: &Path) -> ChannelResult<()> {
        self.upload("sendDocument", "document", chat, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, None, Some(7)),
            ChannelError::RateLimited {
                retry_after: Duration::from_secs(7)
            }
        );
        assert!(classify_failure(StatusCode::BAD_REQUEST, Some("wrong file".into()), None).is_rejected());
        assert!(classify_failure(StatusCode::PAYLOAD_TOO_LARGE, None, None).is_rejected());
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, None, None),
            ChannelError::Network(_)
        ));
    }

    #[test]
    fn test_parse_update() {
        let raw = r#"{
            "update_id": 10,
            "callback_query": {
                "id": "cb1",
                "from": {"id": 42, "is_bot": false, "first_name": "A"},
                "message": {"message_id": 5, "chat": {"id": 42, "type": "private"}, "date": 0},
                "data": "fmt:3:abcdef"
            }
        }"#;
        let update: Update = serde_json::from_str(raw).unwrap();
        let cb = update.callback_query.unwrap();
        assert_eq!(cb.from.id, 42);
        assert_eq!(cb.message.unwrap().chat.id, 42);
        assert_eq!(cb.data.as_deref(), Some("fmt:3:abcdef"));
    }

    #[test]
    fn test_truncate_message() {
        let long = "x".repeat(MESSAGE_LIMIT + 10);
        assert_eq!(truncate_message(&long).chars().count(), MESSAGE_LIMIT);
        assert_eq!(truncate_message("short"), "short");
    }

    #[test]
    fn test_empty_token_rejected() {
        let config = TelegramConfig::default();
        assert!(TelegramChannel::new(&config).is_err());
    }
}
