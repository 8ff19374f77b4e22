//! Input validation for URLs and resolved choices.

use url::Url;

use super::media::FormatChoice;
use crate::{Error, Result};

/// Validate a user-submitted URL and parse it.
pub fn validate_url(raw: &str) -> Result<Url> {
    let u = raw.trim();
    if u.is_empty() {
        return Err(Error::InvalidUrl("empty link".to_string()));
    }
    if !(u.starts_with("http://") || u.starts_with("https://")) {
        return Err(Error::InvalidUrl(format!("unsupported scheme: {u}")));
    }
    if u.chars().any(char::is_whitespace) {
        return Err(Error::InvalidUrl("link contains whitespace".to_string()));
    }
    let parsed = Url::parse(u).map_err(|e| Error::InvalidUrl(e.to_string()))?;
    if parsed.host_str().is_none() {
        return Err(Error::InvalidUrl("link has no host".to_string()));
    }
    Ok(parsed)
}

/// Sanity-check a choice before a job is built from it.
///
/// Failures here mean the policy engine produced something malformed.
pub fn validate_choice(choice: &FormatChoice) -> Result<()> {
    if choice.choice_id.trim().is_empty() {
        return Err(Error::invariant("empty choice id"));
    }
    if choice.label.trim().is_empty() {
        return Err(Error::invariant("empty choice label"));
    }
    if choice.height == 0 {
        return Err(Error::invariant("choice without height"));
    }
    if choice.video.stream_id.trim().is_empty() {
        return Err(Error::invariant("choice without video stream"));
    }
    if choice.audio.stream_id.trim().is_empty() {
        return Err(Error::invariant("choice without audio stream"));
    }
    Ok(())
}
