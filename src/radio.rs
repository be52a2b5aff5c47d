//! UWB radio boundary: the driver trait, interrupt-side events, and the
//! contact/recovery ladder used at session bring-up.
//!
//! Register-level programming lives behind [`RadioDriver`]; the scheduler
//! only queues transmits, arms the receiver, and consumes [`RadioEvent`]s.

use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::FrameBuf;
use crate::ranging::RadioTimestamp;

/// Contact attempts per reset cycle during bring-up.
pub const CONTACT_TRIES_PER_RESET: u32 = 10;

/// Hard resets before the radio is declared unresponsive.
pub const RESETS_BEFORE_GIVING_UP: u32 = 3;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    #[error("radio unresponsive after recovery attempts")]
    Unresponsive,
    #[error("radio busy with another operation")]
    Busy,
    #[error("radio fault: {0}")]
    Fault(&'static str),
}

/// Completion events delivered from radio interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    /// A queued frame left the antenna at `timestamp`.
    TxComplete { timestamp: RadioTimestamp },
    /// A frame arrived at `timestamp`.
    RxComplete {
        frame: FrameBuf,
        timestamp: RadioTimestamp,
    },
    /// The receive window elapsed with nothing heard.
    RxTimeout,
    /// The radio saw a round-start marker; re-anchor slot timing.
    NewRoundStart,
}

/// Driver seam for the UWB transceiver.
///
/// `transmit` and `start_receive` queue work; the corresponding completion
/// arrives later as a [`RadioEvent`] through the scheduler. Implementations
/// must be callable from a critical section and must not block.
pub trait RadioDriver {
    fn init(&mut self) -> Result<(), RadioError>;
    fn force_wake(&mut self) -> Result<(), RadioError>;
    fn hard_reset(&mut self) -> Result<(), RadioError>;
    /// Queue one frame; completion arrives as [`RadioEvent::TxComplete`].
    fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioError>;
    /// Queue one frame for departure at radio-clock time `at`, so a
    /// timestamp embedded in the frame matches the real departure edge.
    /// `at` must be far enough ahead for the radio to set up.
    fn transmit_delayed(&mut self, frame: &[u8], at: RadioTimestamp) -> Result<(), RadioError>;
    /// Arm the receiver for up to `timeout_ticks` ranging-timer ticks.
    fn start_receive(&mut self, timeout_ticks: u32) -> Result<(), RadioError>;
    /// Abort any in-flight operation. Idempotent.
    fn cancel(&mut self);
    /// Current free-running radio clock.
    fn read_clock(&mut self) -> RadioTimestamp;
}

/// Establish contact with the radio, escalating through the recovery ladder:
/// plain init attempts, a forced wakeup halfway through each cycle, a hard
/// reset when a cycle is exhausted, and [`RadioError::Unresponsive`] once the
/// reset budget is spent (the caller escalates to a full device reset).
pub fn bring_up<R: RadioDriver>(radio: &mut R) -> Result<(), RadioError> {
    for reset_round in 0..RESETS_BEFORE_GIVING_UP {
        for attempt in 0..CONTACT_TRIES_PER_RESET {
            if attempt >= CONTACT_TRIES_PER_RESET / 2 {
                let _ = radio.force_wake();
            }
            if radio.init().is_ok() {
                debug!(reset_round, attempt, "radio contact established");
                return Ok(());
            }
        }
        warn!(reset_round, "radio contact failed, hard resetting");
        radio.hard_reset()?;
    }
    Err(RadioError::Unresponsive)
}
