//! Long-polling chat front.
//!
//! Text messages are links or commands; inline buttons carry
//! `fmt:<session_version>:<choice_id>`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ErrorKind;
use crate::delivery::telegram::{CallbackQuery, InlineButton, Message, TelegramChannel, Update};
use crate::domain::{ChatId, FormatChoice, UserId};
use crate::messages;
use crate::services::CourierService;

const CALLBACK_PREFIX: &str = "fmt";

/// Pause after a failed `getUpdates`.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(3);

/// Encode a choice button's callback data.
pub fn encode_callback(session_version: u64, choice_id: &str) -> String {
    format!("{CALLBACK_PREFIX}:{session_version}:{choice_id}")
}

/// Decode callback data into `(session_version, choice_id)`.
pub fn parse_callback(data: &str) -> Option<(u64, &str)> {
    let mut parts = data.splitn(3, ':');
    if parts.next()? != CALLBACK_PREFIX {
        return None;
    }
    let version = parts.next()?.parse().ok()?;
    let choice_id = parts.next().filter(|id| !id.is_empty())?;
    Some((version, choice_id))
}

fn keyboard(session_version: u64, choices: &[FormatChoice]) -> Vec<InlineButton> {
    choices
        .iter()
        .map(|c| InlineButton {
            text: c.label.clone(),
            callback_data: encode_callback(session_version, &c.choice_id),
        })
        .collect()
}

/// A bot command, if the text is one. `/cancel@my_bot` counts as `/cancel`.
fn command(text: &str) -> Option<&str> {
    let first = text.split_whitespace().next()?;
    let name = first.strip_prefix('/')?;
    Some(name.split('@').next().unwrap_or(name))
}

pub struct BotRunner {
    telegram: Arc<TelegramChannel>,
    courier: Arc<CourierService>,
    poll_timeout: Duration,
}

impl BotRunner {
    pub fn new(telegram: Arc<TelegramChannel>, courier: Arc<CourierService>, poll_timeout: Duration) -> Self {
        Self {
            telegram,
            courier,
            poll_timeout,
        }
    }

    /// Poll for updates until `cancel` fires. Each update is handled on its
    /// own task so a slow extraction does not stall polling.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Bot polling started");
        let mut offset = 0i64;
        let mut handlers = JoinSet::new();
        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.telegram.get_updates(offset, self.poll_timeout) => result,
            };
            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let this = Arc::clone(&self);
                        handlers.spawn(async move { this.handle_update(update).await });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to poll updates");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
            while let Some(result) = handlers.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "Update handler failed");
                }
            }
        }
        handlers.abort_all();
        info!("Bot polling stopped");
    }

    async fn handle_update(&self, update: Update) {
        if let Some(callback) = update.callback_query {
            self.on_callback(callback).await;
        } else if let Some(message) = update.message {
            self.on_message(message).await;
        }
    }

    async fn reply(&self, chat: ChatId, text: &str) {
        if let Err(e) = self.telegram.send_text(chat, text).await {
            warn!(chat_id = chat, error = %e, "Failed to send reply");
        }
    }

    async fn on_message(&self, message: Message) {
        let chat = message.chat.id;
        let Some(user) = message.from.as_ref().map(|u| u.id) else {
            return;
        };
        let Some(text) = message.text.as_deref().map(str::trim) else {
            return;
        };

        match command(text) {
            Some("start") | Some("help") => self.reply(chat, messages::PROMPT_SEND_LINK).await,
            Some("cancel") => {
                let result = self.courier.cancel(user, None);
                self.reply(chat, result.message).await;
            }
            Some(other) => debug!(chat_id = chat, command = other, "Unknown command"),
            None => self.on_link(user, chat, text).await,
        }
    }

    async fn on_link(&self, user: UserId, chat: ChatId, text: &str) {
        match self.courier.get_choices(user, text, None).await {
            Ok(result) => {
                let buttons = keyboard(result.session_version, &result.choices);
                let prompt = match &result.title {
                    Some(title) => format!("{title}\n\n{}", messages::CHOOSE_QUALITY),
                    None => messages::CHOOSE_QUALITY.to_string(),
                };
                if let Err(e) = self.telegram.send_keyboard(chat, &prompt, &buttons).await {
                    warn!(chat_id = chat, error = %e, "Failed to send choices");
                }
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::Collaborator | ErrorKind::Internal => {
                        error!(user_id = user, error = %e, "Failed to list formats")
                    }
                    _ => debug!(user_id = user, error = %e, "Link refused"),
                }
                self.reply(chat, e.user_message()).await;
            }
        }
    }

    async fn on_callback(&self, callback: CallbackQuery) {
        let user = callback.from.id;
        let chat = callback.message.as_ref().map(|m| m.chat.id).unwrap_or(user);

        let Some((version, choice_id)) = callback.data.as_deref().and_then(parse_callback) else {
            if let Err(e) = self.telegram.answer_callback(&callback.id, None).await {
                debug!(error = %e, "Failed to answer callback");
            }
            return;
        };

        let result = self.courier.submit(user, chat, version, choice_id);
        if let Err(e) = self
            .telegram
            .answer_callback(&callback.id, Some(result.message))
            .await
        {
            debug!(error = %e, "Failed to answer callback");
        }
        if !result.accepted || result.message != messages::ACCEPTED {
            self.reply(chat, result.message).await;
        }
    }
}
