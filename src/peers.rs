//! Window-scoped table of peers observed on the discovery interface.
//!
//! The first observation after a quiet period opens a new window and drops
//! whatever the previous window collected. Later observations append without
//! deduplication; the election layer collapses duplicates. The table is
//! written from transport callback context and snapshotted by the app task.

use heapless::Vec;

use crate::types::{DeviceId, DiscoveredPeer, RangingRole, MAX_NETWORK_SIZE};

/// What the transport should do with its window timer after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// First observation of a new window; (re)arm the window timer.
    WindowOpened,
    /// Appended to the open window.
    Recorded,
    /// Window already holds the maximum number of entries; dropped.
    TableFull,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Vec<DiscoveredPeer, MAX_NETWORK_SIZE>,
    window_open: bool,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, id: DeviceId, role: RangingRole) -> ObserveOutcome {
        let peer = DiscoveredPeer { id, role };
        if !self.window_open {
            self.peers.clear();
            self.window_open = true;
            let _ = self.peers.push(peer);
            return ObserveOutcome::WindowOpened;
        }
        if self.peers.push(peer).is_ok() {
            ObserveOutcome::Recorded
        } else {
            ObserveOutcome::TableFull
        }
    }

    /// Close the window. Entries stay readable until the next window opens.
    pub fn end_window(&mut self) {
        self.window_open = false;
    }

    pub fn window_is_open(&self) -> bool {
        self.window_open
    }

    pub fn snapshot(&self) -> Vec<DiscoveredPeer, MAX_NETWORK_SIZE> {
        self.peers.clone()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
