//! Common types and utilities shared across logship agent components.

pub mod cycle;
pub mod error;
pub mod store;
pub mod types;

pub use error::{Error, Result};

/// Re-export commonly used external types
pub use bytes::Bytes;
pub use chrono::{DateTime, Utc};

/// Current wall clock in epoch milliseconds, the unit every durable
/// timestamp in the agent is stored in.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
