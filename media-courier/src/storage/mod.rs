//! Ephemeral per-job storage.

pub mod fs;
pub mod temp_area;

pub use temp_area::{TempArea, TempAreaManager};
