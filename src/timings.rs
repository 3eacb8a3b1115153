//! Timing normalization.
//!
//! Pure helpers that bring interval lists into a canonical, order-independent
//! form so they can be merged, compared and chunked. The canonical instant
//! form is RFC 3339 UTC with millisecond precision (`2024-05-01T08:00:00.000Z`).

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

use crate::types::Timing;

/// Maximum number of timings a single target entity may hold.
pub const CHUNK_CAPACITY: usize = 800;

/// Canonical string form of an instant.
pub fn canonical_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Truncate both bounds to millisecond precision.
pub fn canonicalize(timing: &Timing) -> Timing {
    Timing {
        begin: timing.begin.map(|b| b.trunc_subsecs(3)),
        end: timing.end.map(|e| e.trunc_subsecs(3)),
    }
}

/// Canonicalize a list, preserving order and duplicates.
pub fn canonicalize_all(timings: &[Timing]) -> Vec<Timing> {
    timings.iter().map(canonicalize).collect()
}

/// Concatenate two lists and drop exact (begin, end) duplicates, keeping the
/// first occurrence. Result order is `existing` then the new entries of
/// `incoming`.
pub fn union(existing: &[Timing], incoming: &[Timing]) -> Vec<Timing> {
    let mut seen = HashSet::new();
    existing
        .iter()
        .chain(incoming)
        .map(canonicalize)
        .filter(|t| seen.insert(*t))
        .collect()
}

/// Order-independent equality of two timing lists after canonicalization.
/// Duplicates count, as for a sorted-list comparison.
pub fn same_timings(stored: &[Timing], incoming: &[Timing]) -> bool {
    if stored.len() != incoming.len() {
        return false;
    }
    let mut a = canonicalize_all(stored);
    let mut b = canonicalize_all(incoming);
    a.sort();
    b.sort();
    a == b
}

/// Split into consecutive chunks of at most `capacity`, preserving order.
pub fn chunk(timings: &[Timing], capacity: usize) -> Vec<Vec<Timing>> {
    timings
        .chunks(capacity.max(1))
        .map(<[Timing]>::to_vec)
        .collect()
}

/// Serde adapter for optional instants: writes the canonical form, reads any
/// RFC 3339 offset and treats unparseable values as absent.
pub mod serde_instant {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    use super::canonical_instant;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(instant) => serializer.serialize_str(&canonical_instant(instant)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Value::deserialize(deserializer)? {
            Value::String(s) => DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        })
    }
}

impl PartialOrd for Timing {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timing {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.begin, self.end).cmp(&(other.begin, other.end))
    }
}
