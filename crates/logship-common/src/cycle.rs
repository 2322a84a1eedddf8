//! Cycle units: the coarse time buckets tasks are partitioned by, used for
//! expiry arithmetic in the instance store sweep.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const MILLIS_PER_MINUTE: i64 = 60 * 1000;
const MILLIS_PER_HOUR: i64 = 60 * MILLIS_PER_MINUTE;
const MILLIS_PER_DAY: i64 = 24 * MILLIS_PER_HOUR;

/// Time bucket of a task. `M` is month and `m` is minute, so parsing is
/// case-sensitive for those two tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleUnit {
    #[serde(rename = "Y")]
    Year,
    #[serde(rename = "M")]
    Month,
    #[serde(rename = "D")]
    Day,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "m")]
    Minute,
    #[serde(rename = "realtime")]
    RealTime,
}

impl CycleUnit {
    pub fn parse(token: &str) -> Option<CycleUnit> {
        match token {
            "Y" | "y" => Some(CycleUnit::Year),
            "M" => Some(CycleUnit::Month),
            "D" | "d" => Some(CycleUnit::Day),
            "h" | "H" => Some(CycleUnit::Hour),
            "m" => Some(CycleUnit::Minute),
            _ if token.eq_ignore_ascii_case("realtime") => Some(CycleUnit::RealTime),
            _ => None,
        }
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            CycleUnit::Year => "Y",
            CycleUnit::Month => "M",
            CycleUnit::Day => "D",
            CycleUnit::Hour => "h",
            CycleUnit::Minute => "m",
            CycleUnit::RealTime => "realtime",
        }
    }

    pub fn is_real_time(&self) -> bool {
        matches!(self, CycleUnit::RealTime)
    }

    /// Length of one cycle in millis. `None` for real-time tasks, which
    /// have no bucket length.
    pub fn unit_millis(&self) -> Option<i64> {
        match self {
            CycleUnit::Year => Some(365 * MILLIS_PER_DAY),
            CycleUnit::Month => Some(30 * MILLIS_PER_DAY),
            CycleUnit::Day => Some(MILLIS_PER_DAY),
            CycleUnit::Hour => Some(MILLIS_PER_HOUR),
            CycleUnit::Minute => Some(MILLIS_PER_MINUTE),
            CycleUnit::RealTime => None,
        }
    }

    /// Expiry window of `count` cycles, e.g. 3 day-cycles = 72 h.
    pub fn expire_after(&self, count: u32) -> Option<Duration> {
        self.unit_millis()
            .map(|unit| Duration::from_millis(unit as u64 * count as u64))
    }
}

impl fmt::Display for CycleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}
