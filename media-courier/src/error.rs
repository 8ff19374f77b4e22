//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to decide how an error is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input from the user; shown verbatim, never retried.
    UserInput,
    /// No usable encoding could be derived; shown, never retried.
    Policy,
    /// An external collaborator failed; logged in detail, generic message.
    Collaborator,
    /// The job was cancelled; not an error from the user's point of view.
    Cancelled,
    /// Admission was refused because a limit was reached.
    ResourceExhausted,
    /// An internal invariant was violated; fatal to the job only.
    Internal,
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Session expired or choice no longer valid")]
    SessionExpired,

    #[error("Format is not deliverable through the channel")]
    ChoiceUnavailable,

    #[error("No usable formats: {0}")]
    NoUsableFormats(String),

    #[error("Source is a playlist or contains multiple items")]
    PlaylistNotSupported,

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Artifact failed validation: {0}")]
    InvalidArtifact(String),

    #[error("Delivery rejected by channel: {0}")]
    DeliveryRejected(String),

    #[error("Delivery outcome uncertain: {0}")]
    DeliveryUncertain(String),

    #[error("Channel request failed: {0}")]
    Channel(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("Job cancelled")]
    Cancelled,

    #[error("Job queue is full")]
    QueueFull,

    #[error("Job queue is shutting down")]
    ShuttingDown,

    #[error("Active job limit reached")]
    ActiveJobLimit,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Classify the error for surfacing decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidUrl(_)
            | Self::UnsupportedPlatform(_)
            | Self::SessionExpired
            | Self::ChoiceUnavailable
            | Self::PlaylistNotSupported => ErrorKind::UserInput,
            Self::NoUsableFormats(_) => ErrorKind::Policy,
            Self::Extraction(_)
            | Self::Download(_)
            | Self::Merge(_)
            | Self::Probe(_)
            | Self::InvalidArtifact(_)
            | Self::DeliveryRejected(_)
            | Self::DeliveryUncertain(_)
            | Self::Channel(_)
            | Self::Timeout { .. } => ErrorKind::Collaborator,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::QueueFull | Self::ShuttingDown | Self::ActiveJobLimit | Self::RateLimited => {
                ErrorKind::ResourceExhausted
            }
            Self::InvalidStateTransition { .. }
            | Self::Invariant(_)
            | Self::Configuration(_)
            | Self::Io(_)
            | Self::IoPath { .. }
            | Self::Serialization(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// The text shown to the end user for this error.
    pub fn user_message(&self) -> &'static str {
        use crate::messages as m;
        match self {
            Self::InvalidUrl(_) => m::BAD_LINK,
            Self::UnsupportedPlatform(_) => m::UNSUPPORTED_LINK,
            Self::SessionExpired => m::SESSION_EXPIRED,
            Self::ChoiceUnavailable => m::FORMAT_UNAVAILABLE,
            Self::PlaylistNotSupported => m::PLAYLIST_NOT_SUPPORTED,
            Self::NoUsableFormats(_) => m::NO_USABLE_FORMATS,
            Self::DeliveryRejected(_) => m::SEND_FAILED,
            Self::DeliveryUncertain(_) => m::DELIVERY_UNCERTAIN,
            Self::QueueFull | Self::ShuttingDown => m::QUEUE_BUSY,
            Self::ActiveJobLimit => m::ALREADY_ACTIVE_JOB,
            Self::RateLimited => m::RATE_LIMITED,
            Self::Cancelled => m::CANCELLED,
            _ => match self.kind() {
                ErrorKind::Collaborator => m::TRY_ANOTHER_FORMAT,
                _ => m::TRY_LATER,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::SessionExpired.kind(), ErrorKind::UserInput);
        assert_eq!(
            Error::NoUsableFormats("x".into()).kind(),
            ErrorKind::Policy
        );
        assert_eq!(Error::Merge("x".into()).kind(), ErrorKind::Collaborator);
        assert_eq!(Error::QueueFull.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::InvalidStateTransition {
                from: "done".into(),
                to: "sending".into()
            }
            .kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_collaborator_errors_share_generic_message() {
        let download = Error::Download("yt-dlp exited with 1".into()).user_message();
        let probe = Error::Probe("no streams".into()).user_message();
        assert_eq!(download, probe);
        assert!(!download.contains("yt-dlp"));
    }

    #[test]
    fn test_io_path_display() {
        let err = Error::io_path(
            "creating directory",
            Path::new("/tmp/x"),
            std::io::Error::other("denied"),
        );
        let text = err.to_string();
        assert!(text.contains("creating directory"));
        assert!(text.contains("/tmp/x"));
    }
}
