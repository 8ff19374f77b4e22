//! Admission control: everything consulted before a job is created.

pub mod active_jobs;
pub mod rate_limiter;
pub mod session_cache;

pub use active_jobs::{ActiveJobGuard, ActiveJobRegistry};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use session_cache::{SessionCache, SessionSelection};
