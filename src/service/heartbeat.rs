//! Redundancy plumbing: the heartbeat publisher and the liveliness watch a
//! standby uses to decide the primary is gone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::core::NodeVersion;
use crate::transport::messages::{FailOverEvent, Heartbeat, topics};
use crate::transport::{Bus, Subscription};

use super::Shared;

pub(crate) fn run(shared: Arc<Shared>) {
    let period = shared.config.heartbeat_period();
    let publisher = shared.bus.latched_publisher::<Heartbeat>(topics::HEARTBEAT);
    info!(
        period_ms = period.as_millis() as u64,
        "set up heartbeat with matching liveliness lease and deadline"
    );

    while !shared.quitting() {
        publisher.publish(Heartbeat {
            node_version: shared.node_version,
            service_id: shared.service_id,
        });
        // Sleep in short slices so shutdown is observed promptly.
        let deadline = Instant::now() + period;
        while Instant::now() < deadline {
            if shared.quitting() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50).min(period));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveliness {
    /// Heartbeats are arriving within the lease.
    Alive(NodeVersion),
    /// The lease lapsed since the last heartbeat.
    Lost,
    /// No heartbeat observed yet.
    Unobserved,
}

/// Standby-side view of the primary's liveliness. The lease should match the
/// primary's heartbeat period.
pub struct LivelinessMonitor {
    subscription: Subscription<Heartbeat>,
    lease: Duration,
    last_seen: Option<(Instant, Heartbeat)>,
}

impl LivelinessMonitor {
    pub fn new(bus: &Bus, lease: Duration) -> Self {
        Self {
            subscription: bus.subscribe(topics::HEARTBEAT),
            lease,
            last_seen: None,
        }
    }

    pub fn poll(&mut self) -> Liveliness {
        while let Ok(heartbeat) = self.subscription.try_recv() {
            self.last_seen = Some((Instant::now(), heartbeat));
        }
        match &self.last_seen {
            None => Liveliness::Unobserved,
            Some((at, heartbeat)) => {
                if at.elapsed() > self.lease {
                    Liveliness::Lost
                } else {
                    Liveliness::Alive(heartbeat.node_version)
                }
            }
        }
    }
}

/// Announce a fail-over so writers rebind to the replacement's endpoints.
pub fn announce_failover(bus: &Bus) {
    bus.publisher::<FailOverEvent>(topics::FAILOVER)
        .publish(FailOverEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn monitor_tracks_heartbeats_and_lease_expiry() {
        let bus = Bus::new();
        let publisher = bus.latched_publisher::<Heartbeat>(topics::HEARTBEAT);
        let mut monitor = LivelinessMonitor::new(&bus, Duration::from_millis(40));

        assert_eq!(monitor.poll(), Liveliness::Unobserved);

        publisher.publish(Heartbeat {
            node_version: NodeVersion::new(3),
            service_id: Uuid::new_v4(),
        });
        assert_eq!(monitor.poll(), Liveliness::Alive(NodeVersion::new(3)));

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(monitor.poll(), Liveliness::Lost);
    }
}
