//! Core identifier types and timestamp helpers.
//!
//! Identifiers are thin newtypes over strings. Timestamps are always
//! `DateTime<Utc>` in memory and use a single canonical text form whenever they
//! are persisted or hashed.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Unique identifier for a task within a DAG.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(String);

/// Globally unique identifier for a DAG.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DagId(String);

impl TaskId {
    /// Create a new TaskId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl DagId {
    /// Create a new DagId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DagId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DagId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error returned when a persisted timestamp cannot be parsed.
#[derive(Debug, Error)]
#[error("invalid timestamp '{value}': {source}")]
pub struct TimestampParseError {
    value: String,
    #[source]
    source: chrono::ParseError,
}

/// Format a timestamp in the canonical form used for storage and hashing.
///
/// RFC 3339 in UTC with microsecond precision, e.g. `2023-10-05T12:00:00.000000Z`.
/// The fixed width keeps the strings lexicographically ordered.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp previously produced by [`format_timestamp`].
///
/// Any RFC 3339 offset is accepted and converted to UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampParseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|source| TimestampParseError {
            value: value.to_string(),
            source,
        })
}
