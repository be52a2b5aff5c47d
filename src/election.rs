//! Leaderless role election over one discovery window.
//!
//! Every device runs the same pure decision function over its own id and its
//! snapshot of discovered peers, so identical observations always produce
//! identical outcomes and the network converges without a coordinator.

use heapless::Vec;

use crate::types::{DeviceId, DiscoveredPeer, RangingRole, MAX_NETWORK_SIZE};

/// Result of one election: an adopted role (if any) and the peers to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionOutcome {
    pub role: Option<RangingRole>,
    pub joins: Vec<DeviceId, MAX_NETWORK_SIZE>,
}

impl ElectionOutcome {
    fn stay_in_discovery() -> Self {
        Self {
            role: None,
            joins: Vec::new(),
        }
    }

    fn participant(joins: Vec<DeviceId, MAX_NETWORK_SIZE>) -> Self {
        Self {
            role: Some(RangingRole::Participant),
            joins,
        }
    }
}

/// Decide this device's next role from a window snapshot.
///
/// Priority order:
/// 1. A peer advertising MASTER wins outright; join that one peer.
/// 2. Otherwise join every peer advertising PARTICIPANT, each at most once.
/// 3. Otherwise the highest awake id strictly greater than our own is the
///    join target (that device will claim mastership when we enroll).
/// 4. Otherwise remain in discovery.
pub fn elect(own_id: DeviceId, peers: &[DiscoveredPeer]) -> ElectionOutcome {
    if let Some(master) = peers.iter().find(|p| p.role == RangingRole::Master) {
        let mut joins = Vec::new();
        let _ = joins.push(master.id);
        return ElectionOutcome::participant(joins);
    }

    let mut joins: Vec<DeviceId, MAX_NETWORK_SIZE> = Vec::new();
    for peer in peers.iter().filter(|p| p.role == RangingRole::Participant) {
        if !joins.contains(&peer.id) {
            let _ = joins.push(peer.id);
        }
    }
    if !joins.is_empty() {
        return ElectionOutcome::participant(joins);
    }

    let candidate = peers
        .iter()
        .filter(|p| p.role != RangingRole::Asleep)
        .map(|p| p.id)
        .max();
    if let Some(best) = candidate {
        if best > own_id {
            let mut joins = Vec::new();
            let _ = joins.push(best);
            return ElectionOutcome::participant(joins);
        }
    }

    ElectionOutcome::stay_in_discovery()
}
