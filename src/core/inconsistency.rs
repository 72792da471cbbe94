//! Missing-version ranges for participants with gapped edit streams.

use serde::{Deserialize, Serialize};

use super::version::ItineraryVersion;

/// Inclusive range of itinerary versions the database never received.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub lower: ItineraryVersion,
    pub upper: ItineraryVersion,
}

/// Everything a participant must retransmit to close its gaps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistencyRanges {
    pub ranges: Vec<VersionRange>,
    /// The newest version the database has seen from this participant,
    /// applied or buffered.
    pub last_known: ItineraryVersion,
}

impl InconsistencyRanges {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Compute the missing ranges given the next version the database expects and
/// the set of versions currently buffered out of order.
///
/// Buffered versions are walked in modular order starting from `expected`, so
/// the result stays correct across counter wraparound.
pub fn missing_ranges(
    expected: ItineraryVersion,
    buffered: impl IntoIterator<Item = ItineraryVersion>,
) -> Option<InconsistencyRanges> {
    let mut ordered: Vec<ItineraryVersion> = buffered.into_iter().collect();
    if ordered.is_empty() {
        return None;
    }
    ordered.sort_by_key(|v| v.get().wrapping_sub(expected.get()));

    let last_known = *ordered.last().expect("ordered is non-empty");
    let mut ranges = Vec::new();
    let mut cursor = expected;
    for held in ordered {
        if cursor != held {
            let upper = ItineraryVersion::new(held.get().wrapping_sub(1));
            ranges.push(VersionRange {
                lower: cursor,
                upper,
            });
        }
        cursor = held.next();
    }

    Some(InconsistencyRanges { ranges, last_known })
}
