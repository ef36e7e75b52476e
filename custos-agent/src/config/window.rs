//! Maintenance window: a UTC time range during which disruptive
//! remediations are permitted. Serialized as `HH:MM-HH:MM`; the range may
//! wrap midnight.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowParseError {
    #[error("maintenance window must be HH:MM-HH:MM, got {0:?}")]
    BadFormat(String),
    #[error("invalid time {0:?} in maintenance window")]
    BadTime(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl MaintenanceWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        MaintenanceWindow { start, end }
    }

    /// Whether `at` falls inside the window. A window whose end precedes
    /// its start wraps midnight; start == end means the window never opens.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let t = at.time();
        // Truncate to whole minutes so 02:00:30 still counts as 02:00.
        let t = NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t);
        if self.start == self.end {
            false
        } else if self.start < self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

impl FromStr for MaintenanceWindow {
    type Err = WindowParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| WindowParseError::BadFormat(s.to_string()))?;
        let parse = |part: &str| {
            NaiveTime::parse_from_str(part.trim(), "%H:%M")
                .map_err(|_| WindowParseError::BadTime(part.trim().to_string()))
        };
        Ok(MaintenanceWindow::new(parse(start)?, parse(end)?))
    }
}

impl fmt::Display for MaintenanceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

impl Serialize for MaintenanceWindow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MaintenanceWindow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}
