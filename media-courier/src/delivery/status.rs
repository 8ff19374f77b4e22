//! Single-message progress reporting.
//!
//! One chat message per job is edited over time. Edits on a handle are
//! serialized and spaced by a minimum interval; long stages run a looping
//! frame animation that stops on the next stage change.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::channel::{ChannelError, DeliveryChannel};
use crate::domain::{ChatId, MessageId};
use crate::{Error, Result};

/// Identifies one status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusHandle {
    pub chat: ChatId,
    pub message: MessageId,
}

struct LoopTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct HandleState {
    /// Time of the last successful edit.
    last_edit: Mutex<Option<Instant>>,
    looper: parking_lot::Mutex<Option<LoopTask>>,
}

pub struct StatusPresenter {
    channel: Arc<dyn DeliveryChannel>,
    min_interval: Duration,
    loop_interval: Duration,
    states: DashMap<StatusHandle, Arc<HandleState>>,
}

impl StatusPresenter {
    pub fn new(channel: Arc<dyn DeliveryChannel>, min_interval: Duration, loop_interval: Duration) -> Self {
        Self {
            channel,
            min_interval,
            loop_interval: loop_interval.max(min_interval),
            states: DashMap::new(),
        }
    }

    fn state(&self, handle: StatusHandle) -> Arc<HandleState> {
        Arc::clone(&self.states.entry(handle).or_default())
    }

    /// Post a new status message.
    pub async fn begin(&self, chat: ChatId, text: &str) -> Result<StatusHandle> {
        let message = self
            .channel
            .send_status(chat, text)
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;
        let handle = StatusHandle { chat, message };
        self.states.insert(handle, Arc::default());
        Ok(handle)
    }

    /// Track an existing message.
    pub fn attach(&self, chat: ChatId, message: MessageId) -> StatusHandle {
        let handle = StatusHandle { chat, message };
        self.states.entry(handle).or_default();
        handle
    }

    pub async fn set_text(&self, handle: StatusHandle, text: &str) -> Result<()> {
        let state = self.state(handle);
        edit_throttled(&*self.channel, &state, handle, text, self.min_interval)
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }

    /// Cycle `frames` on the message until the loop is stopped.
    pub async fn start_loop(&self, handle: StatusHandle, frames: &'static [&'static str]) {
        if frames.is_empty() {
            return;
        }
        self.stop_loop(handle).await;

        let state = self.state(handle);
        let token = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.channel),
            Arc::clone(&state),
            handle,
            frames,
            self.loop_interval,
            token.clone(),
        ));
        *state.looper.lock() = Some(LoopTask {
            token,
            handle: task,
        });
    }

    pub async fn stop_loop(&self, handle: StatusHandle) {
        let Some(state) = self.states.get(&handle).map(|s| Arc::clone(&s)) else {
            return;
        };
        let task = state.looper.lock().take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    warn!(chat_id = handle.chat, error = %e, "Status loop task failed");
                }
            }
        }
    }

    /// Final text for a successful job; the handle is forgotten afterwards.
    pub async fn finish(&self, handle: StatusHandle, text: &str) {
        self.stop_loop(handle).await;
        if let Err(e) = self.set_text(handle, text).await {
            warn!(chat_id = handle.chat, error = %e, "Failed to set final status");
        }
        self.states.remove(&handle);
    }

    /// Final text for a failed job; the handle is forgotten afterwards.
    pub async fn fail(&self, handle: StatusHandle, text: &str) {
        self.finish(handle, text).await;
    }

    /// Delete the message silently.
    pub async fn remove(&self, handle: StatusHandle) {
        self.stop_loop(handle).await;
        self.states.remove(&handle);
        if let Err(e) = self.channel.delete_status(handle.chat, handle.message).await {
            debug!(chat_id = handle.chat, error = %e, "Failed to delete status message");
        }
    }

    /// Stop every running loop.
    pub async fn stop_all(&self) {
        let handles: Vec<StatusHandle> = self.states.iter().map(|e| *e.key()).collect();
        for handle in handles {
            self.stop_loop(handle).await;
        }
        self.states.clear();
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}

async fn edit_throttled(
    channel: &dyn DeliveryChannel,
    state: &HandleState,
    handle: StatusHandle,
    text: &str,
    min_interval: Duration,
) -> std::result::Result<(), ChannelError> {
    let mut last_edit = state.last_edit.lock().await;
    if let Some(last) = *last_edit {
        let elapsed = last.elapsed();
        if elapsed < min_interval {
            tokio::time::sleep(min_interval - elapsed).await;
        }
    }
    channel.edit_status(handle.chat, handle.message, text).await?;
    *last_edit = Some(Instant::now());
    Ok(())
}

async fn run_loop(
    channel: Arc<dyn DeliveryChannel>,
    state: Arc<HandleState>,
    handle: StatusHandle,
    frames: &'static [&'static str],
    interval: Duration,
    token: CancellationToken,
) {
    let mut idx = 0;
    loop {
        let edit = edit_throttled(&*channel, &state, handle, frames[idx], interval);
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = edit => result,
        };
        match result {
            Ok(()) => idx = (idx + 1) % frames.len(),
            Err(e) => {
                // Transient edit failures keep the loop alive.
                warn!(chat_id = handle.chat, error = %e, "Status loop edit failed");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval.max(Duration::from_millis(500))) => {}
                }
            }
        }
    }
}
