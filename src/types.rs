use core::fmt;
use serde::{Deserialize, Serialize};

/// Link-layer address length in bytes (EUI-48).
pub const DEVICE_ID_LEN: usize = 6;

/// Largest number of tags that can share one ranging network.
pub const MAX_NETWORK_SIZE: usize = 10;

/// Unique device identifier, stored most-significant byte first so the
/// derived ordering compares by numeric magnitude.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    pub const fn new(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an id from the low 48 bits of a serial number.
    pub const fn from_serial(serial: u64) -> Self {
        let b = serial.to_be_bytes();
        Self([b[2], b[3], b[4], b[5], b[6], b[7]])
    }

    pub const fn bytes(&self) -> [u8; DEVICE_ID_LEN] {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Compact single-byte id used in logs and measurement records.
    pub const fn short(&self) -> u8 {
        self.0[DEVICE_ID_LEN - 1]
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Role a device advertises on the discovery interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangingRole {
    /// Not part of any ranging network.
    Unknown,
    /// Owns the slot schedule and broadcasts it each round.
    Master,
    /// Ranges in the slots the master assigns.
    Participant,
    /// Powered down; never a join candidate.
    Asleep,
}

/// One observation recorded during a discovery window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeer {
    pub id: DeviceId,
    pub role: RangingRole,
}

/// One peer distance produced by a completed ranging round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMeasurement {
    pub peer: DeviceId,
    pub distance_mm: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_ordering_is_numeric() {
        let low = DeviceId::from_serial(0x0000_0000_0001);
        let high = DeviceId::from_serial(0x0100_0000_0000);
        assert!(high > low);

        // Magnitude, not byte-local comparison: 0x00ff... < 0x0100...
        let a = DeviceId::new([0x00, 0xff, 0xff, 0xff, 0xff, 0xff]);
        let b = DeviceId::new([0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(b > a);
    }

    #[test]
    fn test_short_id_is_low_byte() {
        let id = DeviceId::from_serial(0x1122_3344_5566);
        assert_eq!(id.short(), 0x66);
        assert_eq!(id.bytes(), [0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    }

    #[test]
    fn test_display_formatting() {
        let id = DeviceId::new([0xc0, 0x98, 0xe5, 0x42, 0x00, 0x0a]);
        assert_eq!(id.to_string(), "c0:98:e5:42:00:0a");
    }
}
