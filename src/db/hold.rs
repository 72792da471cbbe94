//! Buffering for itinerary edits that arrive ahead of the expected version.

use std::collections::BTreeMap;

use crate::core::{InconsistencyRanges, ItineraryChange, ItineraryVersion, missing_ranges};

/// Per-participant store of out-of-order edits. The database drains the
/// contiguous run whenever the gap in front of it closes; whatever remains
/// is surfaced as inconsistency ranges.
#[derive(Debug, Default)]
pub struct HoldBuffer {
    held: BTreeMap<u64, ItineraryChange>,
}

impl HoldBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, version: ItineraryVersion) -> bool {
        self.held.contains_key(&version.get())
    }

    /// Store an edit for later. An edit already held at this version is
    /// replaced; the submitter is retransmitting.
    pub fn hold(&mut self, version: ItineraryVersion, change: ItineraryChange) {
        self.held.insert(version.get(), change);
    }

    pub fn take(&mut self, version: ItineraryVersion) -> Option<ItineraryChange> {
        self.held.remove(&version.get())
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    /// The ranges a participant must retransmit, given the next version the
    /// database expects. None when nothing is held.
    pub fn report(&self, expected: ItineraryVersion) -> Option<InconsistencyRanges> {
        missing_ranges(expected, self.held.keys().map(|v| ItineraryVersion::new(*v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::VersionRange;

    fn v(value: u64) -> ItineraryVersion {
        ItineraryVersion::new(value)
    }

    #[test]
    fn held_edits_come_back_out_by_version() {
        let mut hold = HoldBuffer::new();
        hold.hold(v(3), ItineraryChange::Clear);
        assert!(hold.contains(v(3)));
        assert!(hold.take(v(2)).is_none());
        assert!(matches!(hold.take(v(3)), Some(ItineraryChange::Clear)));
        assert!(hold.is_empty());
    }

    #[test]
    fn retransmission_replaces_held_edit() {
        let mut hold = HoldBuffer::new();
        hold.hold(v(3), ItineraryChange::Clear);
        hold.hold(v(3), ItineraryChange::Erase { routes: vec![] });
        assert_eq!(hold.len(), 1);
        assert!(matches!(
            hold.take(v(3)),
            Some(ItineraryChange::Erase { .. })
        ));
    }

    #[test]
    fn report_names_the_hole_in_front() {
        let mut hold = HoldBuffer::new();
        hold.hold(v(4), ItineraryChange::Clear);
        hold.hold(v(5), ItineraryChange::Clear);
        let report = hold.report(v(2)).unwrap();
        assert_eq!(
            report.ranges,
            vec![VersionRange {
                lower: v(2),
                upper: v(3)
            }]
        );
        assert_eq!(report.last_known, v(5));
    }
}
