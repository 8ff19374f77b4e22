//! media-courier library crate.
//!
//! Turns a link sent to a chat bot into a list of deliverable formats, and a
//! chosen format into a downloaded, stream-copied and validated file uploaded
//! back to the chat.

pub mod admission;
pub mod bot;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod logging;
pub mod media;
pub mod messages;
pub mod pipeline;
pub mod policy;
pub mod services;
pub mod storage;

pub use error::{Error, ErrorKind, Result};
