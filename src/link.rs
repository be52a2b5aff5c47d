//! Discovery and control-plane boundary.
//!
//! The transport advertises this device's id and ranging role, scans for
//! peers, and carries join requests. Observations reach the core through the
//! per-device context (`TagContext::on_peer_discovered`), not through this
//! trait; the trait covers only what the app task asks the transport to do.

use std::time::Duration;

use thiserror::Error;

use crate::types::{DeviceId, RangingRole};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("no device accepted the request before the deadline")]
    JoinTimeout,
    #[error("transport not ready")]
    NotReady,
    #[error("a foreground scan is already in progress")]
    Busy,
}

/// Transport seam for discovery, advertising, and joins.
///
/// Advertising and scanning controls express desired state; the transport
/// reconciles after its own stack events. `single_scan` and `join` block the
/// calling task, bounded by their window/deadline.
pub trait LinkTransport {
    fn start_advertising(&mut self) -> Result<(), LinkError>;
    fn stop_advertising(&mut self) -> Result<(), LinkError>;
    fn is_advertising(&self) -> bool;

    fn start_scanning(&mut self) -> Result<(), LinkError>;
    fn stop_scanning(&mut self) -> Result<(), LinkError>;
    fn is_scanning(&self) -> bool;
    /// Restart the scan without changing the desired scanning state, so
    /// freshly advertising peers are observed promptly.
    fn reset_scanning(&mut self) -> Result<(), LinkError>;

    fn set_advertised_role(&mut self, role: RangingRole);
    fn advertised_role(&self) -> RangingRole;

    /// Bounded foreground scan; observations land in the peer table before
    /// this returns.
    fn single_scan(&mut self, window: Duration) -> Result<(), LinkError>;

    /// Enroll an id with `target`'s scheduling interface. The enrolled id is
    /// `forwarded` when present, otherwise this device's own id. Blocks until
    /// the target accepts or the attempt times out.
    fn join(&mut self, target: DeviceId, forwarded: Option<DeviceId>) -> Result<(), LinkError>;
}
