//! User-facing texts.
//!
//! The status message is a single chat message edited over time; frame sets
//! are cycled by the status presenter while a long stage runs.

pub const PROMPT_SEND_LINK: &str = "Send me a link (http:// or https://) and I will fetch the video.";
pub const CHOOSE_QUALITY: &str = "Choose quality:\n\u{2705} safe to deliver\n\u{26a0}\u{fe0f} may fail, no guarantee";

pub const STATUS_ANALYZING: &str = "\u{1f50d} Looking for the video\u{2026}";
pub const STATUS_MERGING: &str = "\u{1f9f5} Stitching video and audio\u{2026}";
pub const STATUS_VALIDATING: &str = "\u{1f50e} Checking the file\u{2026}";
pub const STATUS_DONE: &str = "\u{1f39e}\u{fe0f} Video is ready!";

pub const DOWNLOAD_FRAMES: &[&str] = &[
    "\u{2b07}\u{fe0f} Downloading\u{2026}",
    "\u{2b07}\u{fe0f}\u{2b07}\u{fe0f} Downloading\u{2026}",
];

pub const UPLOAD_FRAMES: &[&str] = &[
    "\u{1f4e6} Uploading.",
    "\u{1f4e6} Uploading..",
    "\u{1f4e6} Uploading...",
];

pub const ACCEPTED: &str = "Accepted. Starting.";
pub const RISKY_ACCEPTED: &str =
    "\u{26a0}\u{fe0f} This format is in the risk zone and may fail. I will try anyway.";
pub const CANCELLED: &str = "\u{26d4} Stopped.";
pub const NOTHING_TO_CANCEL: &str = "Nothing to stop: no active job.";

pub const BAD_LINK: &str = "That does not look like a video link. Send an http:// or https:// URL.";
pub const UNSUPPORTED_LINK: &str = "\u{26a0}\u{fe0f} This site is not supported yet.";
pub const PLAYLIST_NOT_SUPPORTED: &str = "Playlists are not supported. Send a link to a single video.";
pub const NO_USABLE_FORMATS: &str = "Could not find usable formats for this video.";
pub const SESSION_EXPIRED: &str = "This link is stale. Send it again.";
pub const FORMAT_UNAVAILABLE: &str =
    "\u{274c} This file is too heavy for the chat. Pick a lighter format.";
pub const QUEUE_BUSY: &str = "The download queue is full. Try again later.";
pub const ALREADY_ACTIVE_JOB: &str =
    "A download for you is already running. Wait for it or stop it with /cancel.";
pub const RATE_LIMITED: &str = "Too many requests. Slow down a little.";
pub const TRY_ANOTHER_FORMAT: &str = "\u{26a0}\u{fe0f} Could not process this format. Try another one or try later.";
pub const SEND_FAILED: &str = "\u{26a0}\u{fe0f} The chat did not accept the file. Try a lower quality.";
pub const DELIVERY_UNCERTAIN: &str =
    "\u{26a0}\u{fe0f} Upload was interrupted. The file may still arrive; if not, try again.";
pub const TRY_LATER: &str = "\u{26a0}\u{fe0f} Something went wrong. Try again later.";
