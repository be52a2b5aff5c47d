//! Lock-free event-flag register for the application dispatch loop.
//!
//! Producers run in interrupt context (timer callbacks, radio and transport
//! completions) and OR their bit into a single atomic word. The one consumer
//! task swaps the word to zero, so exactly the bits it observed are cleared
//! and anything posted during handling survives to the next wake. Waiting
//! uses a condvar, never a polling delay loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Application events, one bit each so they can accumulate in a single word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AppEvent {
    /// Ranging network sync was lost; tear down the session.
    NetworkLost = 1 << 0,
    /// Re-check advertising/scanning/role consistency.
    VerifyConfiguration = 1 << 1,
    /// A discovery window closed with at least one observation.
    NetworkFound = 1 << 2,
    /// Battery collaborator reports critically low charge.
    BatteryEvent = 1 << 3,
    /// Management interface asked the tag to reveal its location.
    FindMyTag = 1 << 4,
    /// A device requested enrollment in the ranging schedule.
    ScheduleDevice = 1 << 5,
}

impl AppEvent {
    /// Every event, in the order the dispatch loop services them.
    pub const ALL: [AppEvent; 6] = [
        AppEvent::NetworkLost,
        AppEvent::VerifyConfiguration,
        AppEvent::NetworkFound,
        AppEvent::BatteryEvent,
        AppEvent::FindMyTag,
        AppEvent::ScheduleDevice,
    ];

    pub const fn bit(self) -> u32 {
        self as u32
    }

    pub const fn is_set(self, bits: u32) -> bool {
        bits & self.bit() != 0
    }
}

/// OR-accumulating flag register with a single blocking consumer.
#[derive(Debug, Default)]
pub struct EventFlags {
    bits: AtomicU32,
    // The flag word itself is never behind this lock; it only serializes
    // the sleep/wake handshake so posts cannot slip past a waiter.
    wake_lock: Mutex<()>,
    wake_cond: Condvar,
}

impl EventFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one event bit and wake the consumer. Safe from any context.
    pub fn post(&self, event: AppEvent) {
        self.bits.fetch_or(event.bit(), Ordering::AcqRel);
        drop(self.wake_lock.lock());
        self.wake_cond.notify_one();
    }

    /// Take and clear every currently set bit without blocking.
    pub fn take(&self) -> u32 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    /// Read the pending bits without consuming them.
    pub fn peek(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Block until at least one bit is set, then take the whole word.
    pub fn wait(&self) -> u32 {
        let mut guard = self
            .wake_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            let bits = self.bits.swap(0, Ordering::AcqRel);
            if bits != 0 {
                return bits;
            }
            guard = self
                .wake_cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`EventFlags::wait`], but gives up after `timeout` and returns 0.
    pub fn wait_timeout(&self, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .wake_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            let bits = self.bits.swap(0, Ordering::AcqRel);
            if bits != 0 {
                return bits;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            let (next_guard, result) = self
                .wake_cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next_guard;
            if result.timed_out() {
                return self.bits.swap(0, Ordering::AcqRel);
            }
        }
    }
}
