//! Version clocks: modular itinerary versions and monotone database versions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Compare two wrapping counters of identical bit width.
///
/// `a` precedes `b` iff the wrapped difference `b - a`, reinterpreted as a
/// signed value, is positive. Transitive only within half the counter range.
pub fn modular_lt(a: u64, b: u64) -> bool {
    (b.wrapping_sub(a) as i64) > 0
}

/// `a` precedes or equals `b` under the modular ordering.
pub fn modular_le(a: u64, b: u64) -> bool {
    a == b || modular_lt(a, b)
}

/// Per-participant itinerary edit counter. Wraps on overflow; ordering is
/// modular, so it must never be compared with `<` directly.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItineraryVersion(u64);

impl ItineraryVersion {
    pub const INITIAL: ItineraryVersion = ItineraryVersion(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// True when `self` comes strictly before `other` in the modular order.
    pub fn precedes(self, other: ItineraryVersion) -> bool {
        modular_lt(self.0, other.0)
    }

    pub fn precedes_or_is(self, other: ItineraryVersion) -> bool {
        modular_le(self.0, other.0)
    }
}

impl fmt::Debug for ItineraryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItineraryVersion({})", self.0)
    }
}

impl fmt::Display for ItineraryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global edit counter of the schedule database. Strictly increases on every
/// accepted edit and on participant registration or retirement.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DatabaseVersion(u64);

impl DatabaseVersion {
    pub const ZERO: DatabaseVersion = DatabaseVersion(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Modular comparison, used when screening remediation requests whose
    /// counters may have been minted by an older incarnation of the service.
    pub fn precedes(self, other: DatabaseVersion) -> bool {
        modular_lt(self.0, other.0)
    }
}

impl fmt::Display for DatabaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one incarnation of the schedule service. A standby that takes
/// over announces itself with a higher node version.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeVersion(u64);

impl NodeVersion {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modular_ordering_is_transitive_within_half_range() {
        let a = ItineraryVersion::new(5);
        let b = ItineraryVersion::new(1000);
        let c = ItineraryVersion::new(2_000_000);
        assert!(a.precedes(b));
        assert!(b.precedes(c));
        assert!(a.precedes(c));
    }

    #[test]
    fn modular_ordering_survives_wraparound() {
        let near_max = ItineraryVersion::new(u64::MAX - 1);
        let wrapped = near_max.next().next();
        assert_eq!(wrapped.get(), 0);
        assert!(near_max.precedes(wrapped));
        assert!(!wrapped.precedes(near_max));
    }

    #[test]
    fn equality_is_bitwise() {
        let a = ItineraryVersion::new(42);
        let b = ItineraryVersion::new(42);
        assert_eq!(a, b);
        assert!(!a.precedes(b));
        assert!(a.precedes_or_is(b));
    }

    #[test]
    fn database_version_advances() {
        let v = DatabaseVersion::ZERO;
        assert_eq!(v.next().get(), 1);
        assert!(v < v.next());
        assert!(v.precedes(v.next()));
    }
}
