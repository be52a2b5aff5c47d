//! Two-way-ranging timestamp arithmetic.
//!
//! UWB radio timestamps count device time units of roughly 15.65 ps (a
//! 499.2 MHz reference sampled 128x) in a 40-bit counter, so the clock wraps
//! about every 17 seconds. All deltas are taken modulo the counter width.

use serde::{Deserialize, Serialize};

/// Radio time units per second.
pub const TICKS_PER_SECOND: u64 = 63_897_600_000;

/// The timestamp counter is 40 bits wide.
pub const TICK_MODULUS: u64 = 1 << 40;

const SPEED_OF_LIGHT_M_PER_S: u64 = 299_792_458;

/// Longest plausible one-way flight: 1 ms of light travel. Anything above
/// this is a corrupt exchange, not a measurement.
const MAX_PLAUSIBLE_TOF_TICKS: i64 = (TICKS_PER_SECOND / 1000) as i64;

/// Small negative readings happen with unmodeled antenna delay; larger ones
/// mean the exchange is garbage.
const MIN_PLAUSIBLE_TOF_TICKS: i64 = -1024;

/// A raw radio timestamp in device time units, modulo [`TICK_MODULUS`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct RadioTimestamp(u64);

impl RadioTimestamp {
    pub const fn new(ticks: u64) -> Self {
        Self(ticks & (TICK_MODULUS - 1))
    }

    pub const fn ticks(self) -> u64 {
        self.0
    }

    /// Ticks elapsed from `earlier` to `self`, tolerating one counter wrap.
    pub const fn ticks_since(self, earlier: RadioTimestamp) -> u64 {
        self.0.wrapping_sub(earlier.0) & (TICK_MODULUS - 1)
    }
}

/// The four timestamps of one closed single-sided two-way exchange.
///
/// `poll` is our ranging frame, `resp` is the peer frame that echoed our
/// poll's arrival time. `poll_tx`/`resp_rx` are on our clock,
/// `poll_rx`/`resp_tx` on the peer's; the offset between the two clocks
/// cancels out of the time-of-flight algebra.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwoWayExchange {
    pub poll_tx: RadioTimestamp,
    pub poll_rx: RadioTimestamp,
    pub resp_tx: RadioTimestamp,
    pub resp_rx: RadioTimestamp,
}

impl TwoWayExchange {
    /// One-way time of flight in radio ticks: half of (round trip on our
    /// clock minus turnaround on theirs).
    pub fn time_of_flight_ticks(&self) -> i64 {
        let round = self.resp_rx.ticks_since(self.poll_tx) as i64;
        let reply = self.resp_tx.ticks_since(self.poll_rx) as i64;
        (round - reply) / 2
    }

    /// Distance in millimetres, or `None` when the exchange is implausible.
    pub fn distance_mm(&self) -> Option<i32> {
        let tof = self.time_of_flight_ticks();
        if !(MIN_PLAUSIBLE_TOF_TICKS..=MAX_PLAUSIBLE_TOF_TICKS).contains(&tof) {
            return None;
        }
        Some(ticks_to_mm(tof))
    }
}

/// Convert a time of flight in radio ticks to millimetres.
pub fn ticks_to_mm(tof_ticks: i64) -> i32 {
    let numerator = tof_ticks as i128 * SPEED_OF_LIGHT_M_PER_S as i128 * 1000;
    (numerator / TICKS_PER_SECOND as i128) as i32
}

/// Convert a one-way distance in millimetres to radio ticks, rounding to
/// the nearest tick.
pub fn mm_to_ticks(distance_mm: i64) -> i64 {
    let denominator = SPEED_OF_LIGHT_M_PER_S as i128 * 1000;
    let numerator = distance_mm as i128 * TICKS_PER_SECOND as i128 + denominator / 2;
    (numerator / denominator) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ticks: u64) -> RadioTimestamp {
        RadioTimestamp::new(ticks)
    }

    #[test]
    fn test_tick_is_about_4_7_mm() {
        assert_eq!(ticks_to_mm(1), 4);
        assert_eq!(ticks_to_mm(100), 469);
        assert_eq!(ticks_to_mm(-100), -469);
    }

    #[test]
    fn test_mm_to_ticks_round_trips_within_a_tick() {
        for mm in [0i64, 500, 3000, 4000, 5000, 25_000] {
            let back = i64::from(ticks_to_mm(mm_to_ticks(mm)));
            assert!((back - mm).abs() <= 5, "{mm} mm came back as {back} mm");
        }
    }

    #[test]
    fn test_zero_flight_time_is_zero_distance() {
        let exchange = TwoWayExchange {
            poll_tx: ts(1000),
            poll_rx: ts(500_000),
            resp_tx: ts(500_400),
            resp_rx: ts(1400),
        };
        assert_eq!(exchange.time_of_flight_ticks(), 0);
        assert_eq!(exchange.distance_mm(), Some(0));
    }

    #[test]
    fn test_clock_offset_cancels() {
        // Peer clock runs 7_000_000 ticks ahead; true tof is 853 ticks.
        let tof = 853;
        let offset = 7_000_000;
        let poll_tx = 10_000;
        let poll_rx = poll_tx + tof + offset;
        let resp_tx = poll_rx + 120_000; // turnaround on peer clock
        let resp_rx = resp_tx - offset + tof;
        let exchange = TwoWayExchange {
            poll_tx: ts(poll_tx),
            poll_rx: ts(poll_rx),
            resp_tx: ts(resp_tx),
            resp_rx: ts(resp_rx),
        };
        assert_eq!(exchange.time_of_flight_ticks(), tof as i64);
        // 853 ticks ≈ 4.0 m
        let mm = exchange.distance_mm().unwrap();
        assert!((3990..=4010).contains(&mm), "got {mm}");
    }

    #[test]
    fn test_counter_wrap_is_handled() {
        let tof = 640; // ~3 m
        let poll_tx = TICK_MODULUS - 200;
        let poll_rx = (poll_tx + tof) % TICK_MODULUS;
        let resp_tx = (poll_rx + 50_000) % TICK_MODULUS;
        let resp_rx = (resp_tx + tof) % TICK_MODULUS;
        let exchange = TwoWayExchange {
            poll_tx: ts(poll_tx),
            poll_rx: ts(poll_rx),
            resp_tx: ts(resp_tx),
            resp_rx: ts(resp_rx),
        };
        assert_eq!(exchange.time_of_flight_ticks(), tof as i64);
    }

    #[test]
    fn test_implausible_exchange_is_rejected() {
        let exchange = TwoWayExchange {
            poll_tx: ts(0),
            poll_rx: ts(0),
            resp_tx: ts(0),
            resp_rx: ts(TICKS_PER_SECOND / 2), // quarter second of "flight"
        };
        assert_eq!(exchange.distance_mm(), None);
    }
}
