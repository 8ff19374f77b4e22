//! Job entity and its stage state machine.

use serde::{Deserialize, Serialize};

use super::media::{FormatChoice, Platform};
use crate::Error;

pub type UserId = i64;
pub type ChatId = i64;
pub type MessageId = i64;

/// Opaque, unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job processing stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    /// Waiting in the queue.
    #[default]
    Queued,
    /// Picked by a worker, preparing the working area.
    Analyzing,
    /// Fetching the selected streams.
    Downloading,
    /// Stream-copy muxing into the target container.
    Merging,
    /// Probing the merged artifact.
    Validating,
    /// Uploading to the chat.
    Sending,
    /// Delivered.
    Done,
    /// Stopped on request.
    Cancelled,
    /// Stopped by an error.
    Failed,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Analyzing => "analyzing",
            Self::Downloading => "downloading",
            Self::Merging => "merging",
            Self::Validating => "validating",
            Self::Sending => "sending",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }

    /// The stage that follows this one on the success path.
    pub fn next(&self) -> Option<JobStage> {
        use JobStage::*;
        match self {
            Queued => Some(Analyzing),
            Analyzing => Some(Downloading),
            Downloading => Some(Merging),
            Merging => Some(Validating),
            Validating => Some(Sending),
            Sending => Some(Done),
            Done | Cancelled | Failed => None,
        }
    }

    /// Validate a stage transition.
    pub fn can_transition_to(&self, target: JobStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            JobStage::Cancelled | JobStage::Failed => true,
            other => self.next() == Some(other),
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download-and-deliver job for one selected choice.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub platform: Platform,
    pub url: String,
    pub choice: FormatChoice,
    stage: JobStage,
    pub status_message_id: Option<MessageId>,
}

impl Job {
    pub fn new(
        user_id: UserId,
        chat_id: ChatId,
        platform: Platform,
        url: impl Into<String>,
        choice: FormatChoice,
    ) -> Self {
        Self {
            id: JobId::new(),
            user_id,
            chat_id,
            platform,
            url: url.into(),
            choice,
            stage: JobStage::Queued,
            status_message_id: None,
        }
    }

    pub fn stage(&self) -> JobStage {
        self.stage
    }

    /// Move to `target`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, target: JobStage) -> crate::Result<()> {
        if !self.stage.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.stage.to_string(),
                to: target.to_string(),
            });
        }
        self.stage = target;
        Ok(())
    }
}
