//! Atom lifecycle status.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LedgerError;

/// Lifecycle state of one evidence atom.
///
/// The derived `Ord` follows declaration order, which is the lifecycle order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AtomStatus {
    /// Observed but not cited by any actionable ticket.
    #[default]
    New,
    /// Cited by a non-blocked backlog ticket.
    Ticketed,
    /// Ticket exported into a work queue.
    Queued,
    /// Work landed.
    Actioned,
}

impl AtomStatus {
    pub const ALL: [AtomStatus; 4] = [
        AtomStatus::New,
        AtomStatus::Ticketed,
        AtomStatus::Queued,
        AtomStatus::Actioned,
    ];

    /// Numeric rank (new = 0 .. actioned = 3).
    pub fn rank(self) -> u8 {
        match self {
            AtomStatus::New => 0,
            AtomStatus::Ticketed => 1,
            AtomStatus::Queued => 2,
            AtomStatus::Actioned => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AtomStatus::New => "new",
            AtomStatus::Ticketed => "ticketed",
            AtomStatus::Queued => "queued",
            AtomStatus::Actioned => "actioned",
        }
    }

    /// Return `desired` when it is the same or later than `self`, else `self`.
    pub fn promote(self, desired: AtomStatus) -> AtomStatus {
        if desired.rank() >= self.rank() {
            desired
        } else {
            self
        }
    }
}

impl fmt::Display for AtomStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AtomStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned = s.trim().to_ascii_lowercase();
        if cleaned.is_empty() {
            return Ok(AtomStatus::New);
        }
        AtomStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == cleaned)
            .ok_or_else(|| LedgerError::UnsupportedStatus(s.to_string()))
    }
}

impl Serialize for AtomStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AtomStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            None => Ok(AtomStatus::New),
            Some(value) => value.parse().map_err(serde::de::Error::custom),
        }
    }
}
