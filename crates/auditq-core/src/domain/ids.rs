//! Record identifiers.
//!
//! `task_id` is caller-assigned and may repeat, so the processor tags every
//! admitted record with its own ULID. ULIDs sort by creation time, which keeps
//! log lines and snapshots easy to follow.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Ulid);

impl RecordId {
    /// New id stamped with the current wall-clock time.
    pub fn generate() -> Self {
        Self::at(Utc::now())
    }

    /// New id stamped with `time` (random low bits).
    pub fn at(time: DateTime<Utc>) -> Self {
        let timestamp_ms = u64::try_from(time.timestamp_millis()).unwrap_or(0);
        Self(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for RecordId {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rec-{}", self.0)
    }
}
