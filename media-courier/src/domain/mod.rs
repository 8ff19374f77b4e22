//! Domain layer: media value types, the job entity and input validation.

pub mod job;
pub mod media;
pub mod validation;

pub use job::{ChatId, Job, JobId, JobStage, MessageId, UserId};
pub use media::{
    AudioCodec, Availability, ChoiceKey, Container, FormatChoice, Platform, RawCandidateStream,
    StreamRef, VideoCodec,
};
pub use validation::{validate_choice, validate_url};
