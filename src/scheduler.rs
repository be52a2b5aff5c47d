//! TDMA ranging round state machine.
//!
//! One scheduler instance drives one device's side of the shared round
//! structure: the master broadcasts the slot table, every member transmits a
//! ranging frame in its own slot and listens in the others, a status pass
//! reports which slots were heard, and the computation step turns closed
//! timestamp exchanges into distances. Faults never propagate as errors;
//! they divert the machine to a fault phase that discards the round and
//! returns to the schedule phase on the next timer tick.
//!
//! `on_timer_tick` and `on_radio_event` run in interrupt context; `run`,
//! `stop`, and `add_device` run in task context. All shared state sits
//! behind one short critical section, with the phase and activity flags
//! mirrored in atomics so task-context code can inspect them without
//! blocking. Nothing on the steady-state path allocates.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arrayvec::ArrayString;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{AppEvent, EventFlags};
use crate::protocol::{
    peek_tag, EchoEntry, FrameBuf, PacketTag, RangingFrame, ScheduleFrame, StatusFrame,
};
use crate::radio::{RadioDriver, RadioEvent};
use crate::ranging::{RadioTimestamp, TwoWayExchange, TICKS_PER_SECOND};
use crate::types::{DeviceId, RangeMeasurement, RangingRole, MAX_NETWORK_SIZE};

/// Default deadline, in timer ticks, for a round's schedule broadcast.
pub const DEFAULT_SCHEDULE_TIMEOUT_TICKS: u32 = 4;

/// Default guard interval between rounds, in timer ticks.
pub const DEFAULT_UNSCHEDULED_TICKS: u32 = 2;

/// Default budget of consecutive faulted rounds before the network is
/// declared lost. Sized to ride out a full round of resync misses.
pub const DEFAULT_MAX_ROUND_FAULTS: u32 = 16;

/// Lead time granted to the radio for a delayed transmission (1 ms).
const TX_SETUP_DELAY_TICKS: u64 = TICKS_PER_SECOND / 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub schedule_timeout_ticks: u32,
    pub unscheduled_ticks: u32,
    pub max_round_faults: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_timeout_ticks: DEFAULT_SCHEDULE_TIMEOUT_TICKS,
            unscheduled_ticks: DEFAULT_UNSCHEDULED_TICKS,
            max_round_faults: DEFAULT_MAX_ROUND_FAULTS,
        }
    }
}

/// Phases of one ranging round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchedulePhase {
    /// Master broadcasts the slot table; everyone else adopts it.
    Schedule = 0,
    /// One transmit slot per member, everyone listens in between.
    Ranging = 1,
    /// Members report which ranging slots they heard.
    RangeStatus = 2,
    /// Closed exchanges become distances and leave through the sink.
    RangeComputation = 3,
    /// Guard interval; radio quiet.
    UnscheduledTime = 4,
    /// Queued enrollments merge into the slot table.
    UpdatingSchedule = 5,
    /// Malformed timing diverted the round.
    RangingError = 6,
    /// Two transmitters shared one slot.
    MessageCollision = 7,
}

impl SchedulePhase {
    const fn from_raw(raw: u8) -> SchedulePhase {
        match raw {
            1 => SchedulePhase::Ranging,
            2 => SchedulePhase::RangeStatus,
            3 => SchedulePhase::RangeComputation,
            4 => SchedulePhase::UnscheduledTime,
            5 => SchedulePhase::UpdatingSchedule,
            6 => SchedulePhase::RangingError,
            7 => SchedulePhase::MessageCollision,
            _ => SchedulePhase::Schedule,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub rounds_completed: u32,
    pub rounds_faulted: u32,
    pub collisions: u32,
    pub frames_dropped: u32,
    pub measurements_produced: u32,
    pub merges_applied: u32,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("cannot run a ranging session as {0:?}")]
    InvalidRole(RangingRole),
    #[error("ranging network is at capacity")]
    NetworkFull,
}

/// Consumer of completed-round measurements.
///
/// Called from the scheduler's critical section when a round closes with at
/// least one distance; implementations must return quickly and must not call
/// back into the scheduler.
pub trait RangeSink {
    fn ranges_complete(&mut self, round: u32, measurements: &[RangeMeasurement]);
}

/// Everything recorded about one slot of the current round.
#[derive(Debug, Clone, Copy, Default)]
struct SlotRecord {
    heard: bool,
    /// Transmit timestamp from the peer's frame header (peer clock).
    peer_tx: RadioTimestamp,
    /// When the peer's frame reached our antenna (our clock).
    our_rx: RadioTimestamp,
    /// The peer's echoed arrival time of our own frame (peer clock).
    echo_of_us: Option<RadioTimestamp>,
    /// The peer's status report, once heard.
    status_mask: Option<u16>,
}

#[derive(Debug)]
struct RoundState {
    index: u32,
    tick_in_phase: u32,
    slot_cursor: usize,
    own_slot: Option<usize>,
    our_tx_timestamp: Option<RadioTimestamp>,
    tx_pending: bool,
    rx_seen_this_slot: bool,
    heard_mask: u16,
    slots: [SlotRecord; MAX_NETWORK_SIZE],
}

impl RoundState {
    fn new() -> Self {
        let mut state = Self {
            index: 0,
            tick_in_phase: 0,
            slot_cursor: 0,
            own_slot: None,
            our_tx_timestamp: None,
            tx_pending: false,
            rx_seen_this_slot: false,
            heard_mask: 0,
            slots: [SlotRecord::default(); MAX_NETWORK_SIZE],
        };
        state.begin(0);
        state
    }

    /// Discard every record and start counting round `index`.
    fn begin(&mut self, index: u32) {
        self.index = index;
        self.tick_in_phase = 0;
        self.slot_cursor = 0;
        self.own_slot = None;
        self.our_tx_timestamp = None;
        self.tx_pending = false;
        self.rx_seen_this_slot = false;
        self.heard_mask = 0;
        self.slots = [SlotRecord::default(); MAX_NETWORK_SIZE];
    }
}

struct SchedulerCore<R, S> {
    own_id: DeviceId,
    radio: R,
    sink: S,
    config: SchedulerConfig,
    active: bool,
    role: RangingRole,
    time_origin: u64,
    phase: SchedulePhase,
    /// Live slot table; index is the slot number.
    slots: Vec<DeviceId, MAX_NETWORK_SIZE>,
    /// Enrollments waiting for the next schedule update.
    pending: Vec<DeviceId, MAX_NETWORK_SIZE>,
    round: RoundState,
    consecutive_faults: u32,
    rounds_without_slot: u32,
    last_results: Vec<RangeMeasurement, MAX_NETWORK_SIZE>,
    /// Reason string of the most recent fault, kept for diagnostics.
    last_fault: ArrayString<64>,
    stats: SchedulerStats,
}

/// One device's TDMA ranging scheduler.
pub struct RangingScheduler<R, S> {
    core: Mutex<SchedulerCore<R, S>>,
    active: AtomicBool,
    phase_mirror: AtomicU8,
    events: Arc<EventFlags>,
}

impl<R: RadioDriver, S: RangeSink> RangingScheduler<R, S> {
    pub fn new(own_id: DeviceId, radio: R, sink: S, events: Arc<EventFlags>) -> Self {
        Self::with_config(own_id, radio, sink, events, SchedulerConfig::default())
    }

    pub fn with_config(
        own_id: DeviceId,
        radio: R,
        sink: S,
        events: Arc<EventFlags>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            core: Mutex::new(SchedulerCore {
                own_id,
                radio,
                sink,
                config,
                active: false,
                role: RangingRole::Unknown,
                time_origin: 0,
                phase: SchedulePhase::Schedule,
                slots: Vec::new(),
                pending: Vec::new(),
                round: RoundState::new(),
                consecutive_faults: 0,
                rounds_without_slot: 0,
                last_results: Vec::new(),
                last_fault: ArrayString::new(),
                stats: SchedulerStats::default(),
            }),
            active: AtomicBool::new(false),
            phase_mirror: AtomicU8::new(SchedulePhase::Schedule as u8),
            events,
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, SchedulerCore<R, S>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)start a ranging session. A master seeds the slot table with its
    /// own id and broadcasts immediately; a participant starts listening for
    /// the schedule broadcast. Safe to call on an already running session.
    /// The platform's periodic ranging timer is expected to be running once
    /// this returns; ticks while stopped are ignored.
    pub fn run(&self, role: RangingRole, time_origin: u64) -> Result<(), SchedulerError> {
        if !matches!(role, RangingRole::Master | RangingRole::Participant) {
            return Err(SchedulerError::InvalidRole(role));
        }
        let mut core = self.lock_core();
        core.role = role;
        core.time_origin = time_origin;
        core.consecutive_faults = 0;
        core.rounds_without_slot = 0;
        core.last_fault.clear();
        core.pending.clear();
        core.slots.clear();
        if role == RangingRole::Master {
            let own_id = core.own_id;
            let _ = core.slots.push(own_id);
        }
        core.round.begin(0);
        core.active = true;
        self.active.store(true, Ordering::Release);
        debug!(role = ?role, time_origin, "ranging session started");
        self.enter_schedule(&mut core);
        Ok(())
    }

    /// Tear the session down and quiesce the radio. Idempotent.
    pub fn stop(&self) {
        let mut core = self.lock_core();
        if !core.active {
            return;
        }
        core.active = false;
        self.active.store(false, Ordering::Release);
        core.radio.cancel();
        core.slots.clear();
        core.pending.clear();
        core.role = RangingRole::Unknown;
        core.round.begin(0);
        self.set_phase(&mut core, SchedulePhase::Schedule);
        debug!("ranging session stopped");
    }

    /// Queue a device for enrollment. The live slot table is untouched until
    /// the machine passes through the schedule-update phase.
    pub fn add_device(&self, id: DeviceId) -> Result<(), SchedulerError> {
        let mut core = self.lock_core();
        if core.slots.contains(&id) || core.pending.contains(&id) {
            return Ok(());
        }
        core.pending
            .push(id)
            .map_err(|_| SchedulerError::NetworkFull)?;
        debug!(%id, "device queued for the next schedule update");
        Ok(())
    }

    /// Periodic ranging-timer interrupt. One tick is one slot interval.
    pub fn on_timer_tick(&self) {
        let mut core = self.lock_core();
        if !core.active {
            return;
        }
        core.round.tick_in_phase += 1;
        match core.phase {
            SchedulePhase::Schedule => self.tick_schedule(&mut core),
            SchedulePhase::Ranging => self.tick_ranging(&mut core),
            SchedulePhase::RangeStatus => self.tick_range_status(&mut core),
            SchedulePhase::RangeComputation => self.enter_unscheduled(&mut core),
            SchedulePhase::UnscheduledTime => self.tick_unscheduled(&mut core),
            SchedulePhase::UpdatingSchedule => self.enter_schedule(&mut core),
            SchedulePhase::RangingError | SchedulePhase::MessageCollision => {
                // Fault phases last exactly one tick, then a fresh round.
                self.enter_schedule(&mut core);
            }
        }
    }

    /// Radio completion interrupt.
    pub fn on_radio_event(&self, event: RadioEvent) {
        let mut core = self.lock_core();
        if !core.active {
            return;
        }
        if matches!(
            core.phase,
            SchedulePhase::RangingError | SchedulePhase::MessageCollision
        ) {
            // The round is already condemned; late completions are noise.
            return;
        }
        match event {
            RadioEvent::TxComplete { timestamp } => self.handle_tx_complete(&mut core, timestamp),
            RadioEvent::RxComplete { frame, timestamp } => {
                self.handle_rx_complete(&mut core, &frame, timestamp);
            }
            RadioEvent::RxTimeout => {
                // The slot simply stays unresolved; the next tick moves on.
            }
            RadioEvent::NewRoundStart => {
                core.round.tick_in_phase = 0;
            }
        }
    }

    // Task-context inspection; never touches the critical section unless noted.

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn get_phase(&self) -> SchedulePhase {
        SchedulePhase::from_raw(self.phase_mirror.load(Ordering::Acquire))
    }

    pub fn get_role(&self) -> RangingRole {
        self.lock_core().role
    }

    pub fn get_stats(&self) -> SchedulerStats {
        self.lock_core().stats
    }

    pub fn get_round_index(&self) -> u32 {
        self.lock_core().round.index
    }

    pub fn get_time_origin(&self) -> u64 {
        self.lock_core().time_origin
    }

    pub fn get_slot_table(&self) -> Vec<DeviceId, MAX_NETWORK_SIZE> {
        self.lock_core().slots.clone()
    }

    pub fn get_pending(&self) -> Vec<DeviceId, MAX_NETWORK_SIZE> {
        self.lock_core().pending.clone()
    }

    pub fn get_last_round_results(&self) -> Vec<RangeMeasurement, MAX_NETWORK_SIZE> {
        self.lock_core().last_results.clone()
    }

    /// Reason string of the most recent round fault, empty if none yet.
    pub fn get_last_fault(&self) -> ArrayString<64> {
        self.lock_core().last_fault
    }

    // Phase engine.

    fn set_phase(&self, core: &mut SchedulerCore<R, S>, phase: SchedulePhase) {
        core.phase = phase;
        self.phase_mirror.store(phase as u8, Ordering::Release);
    }

    /// Open a new round in the schedule phase.
    fn enter_schedule(&self, core: &mut SchedulerCore<R, S>) {
        self.set_phase(core, SchedulePhase::Schedule);
        let next = core.round.index.wrapping_add(1);
        core.round.begin(next);
        match core.role {
            RangingRole::Master => {
                let own_id = core.own_id;
                core.round.own_slot = core.slots.iter().position(|id| *id == own_id);
                let frame = ScheduleFrame {
                    round: next,
                    slots: core.slots.clone(),
                };
                core.round.tx_pending = true;
                if let Err(e) = core.radio.transmit(frame.encode().as_slice()) {
                    warn!(error = %e, "schedule broadcast failed");
                    self.fault(core, SchedulePhase::RangingError, "schedule broadcast failed");
                }
            }
            RangingRole::Participant => {
                let timeout = core.config.schedule_timeout_ticks;
                if let Err(e) = core.radio.start_receive(timeout) {
                    warn!(error = %e, "schedule listen failed");
                    self.fault(core, SchedulePhase::RangingError, "schedule listen failed");
                }
            }
            _ => {}
        }
    }

    fn tick_schedule(&self, core: &mut SchedulerCore<R, S>) {
        // Master is waiting on its broadcast completion, participant on the
        // broadcast itself; both waits are deadline-bounded.
        if core.round.tick_in_phase > core.config.schedule_timeout_ticks {
            let reason = if core.role == RangingRole::Master {
                "schedule transmit stalled"
            } else {
                "no schedule broadcast heard"
            };
            self.fault(core, SchedulePhase::RangingError, reason);
        }
    }

    fn enter_ranging(&self, core: &mut SchedulerCore<R, S>) {
        debug_assert!(
            !core.slots.is_empty(),
            "ranging phase with an empty slot table"
        );
        self.set_phase(core, SchedulePhase::Ranging);
        core.round.tick_in_phase = 0;
        core.round.slot_cursor = 0;
        core.round.rx_seen_this_slot = false;
        self.slot_action_ranging(core);
    }

    fn tick_ranging(&self, core: &mut SchedulerCore<R, S>) {
        // Each slot spans two ticks so a delayed transmission queued at slot
        // entry has left the air before the cursor moves on.
        if core.round.tick_in_phase < 2 {
            return;
        }
        core.round.tick_in_phase = 0;
        core.round.rx_seen_this_slot = false;
        core.round.slot_cursor += 1;
        if core.round.slot_cursor >= core.slots.len() {
            self.enter_range_status(core);
        } else {
            self.slot_action_ranging(core);
        }
    }

    fn slot_action_ranging(&self, core: &mut SchedulerCore<R, S>) {
        if core.round.own_slot == Some(core.round.slot_cursor) {
            self.transmit_ranging_frame(core);
        } else if let Err(e) = core.radio.start_receive(1) {
            warn!(error = %e, "receiver arm failed");
            self.fault(core, SchedulePhase::RangingError, "receiver arm failed");
        }
    }

    /// Queue our ranging frame as a delayed transmission so the embedded
    /// timestamp matches the actual departure time.
    fn transmit_ranging_frame(&self, core: &mut SchedulerCore<R, S>) {
        let tx_at = RadioTimestamp::new(
            core.radio
                .read_clock()
                .ticks()
                .wrapping_add(TX_SETUP_DELAY_TICKS),
        );
        let mut echoes = Vec::new();
        for (slot, record) in core.round.slots.iter().enumerate().take(core.slots.len()) {
            if record.heard {
                let _ = echoes.push(EchoEntry {
                    slot: slot as u8,
                    rx_timestamp: record.our_rx,
                });
            }
        }
        let frame = RangingFrame {
            slot: core.round.slot_cursor as u8,
            tx_timestamp: tx_at,
            echoes,
        };
        core.round.our_tx_timestamp = Some(tx_at);
        core.round.tx_pending = true;
        if let Err(e) = core.radio.transmit_delayed(frame.encode().as_slice(), tx_at) {
            warn!(error = %e, "ranging transmit failed");
            self.fault(core, SchedulePhase::RangingError, "ranging transmit failed");
        }
    }

    fn enter_range_status(&self, core: &mut SchedulerCore<R, S>) {
        self.set_phase(core, SchedulePhase::RangeStatus);
        core.round.tick_in_phase = 0;
        core.round.slot_cursor = 0;
        core.round.rx_seen_this_slot = false;
        self.slot_action_status(core);
    }

    fn tick_range_status(&self, core: &mut SchedulerCore<R, S>) {
        if core.round.tick_in_phase < 2 {
            return;
        }
        core.round.tick_in_phase = 0;
        core.round.rx_seen_this_slot = false;
        core.round.slot_cursor += 1;
        if core.round.slot_cursor >= core.slots.len() {
            self.enter_range_computation(core);
        } else {
            self.slot_action_status(core);
        }
    }

    fn slot_action_status(&self, core: &mut SchedulerCore<R, S>) {
        if core.round.own_slot == Some(core.round.slot_cursor) {
            let frame = StatusFrame {
                slot: core.round.slot_cursor as u8,
                heard_mask: core.round.heard_mask,
            };
            core.round.tx_pending = true;
            if let Err(e) = core.radio.transmit(frame.encode().as_slice()) {
                warn!(error = %e, "status transmit failed");
                self.fault(core, SchedulePhase::RangingError, "status transmit failed");
            }
        } else if let Err(e) = core.radio.start_receive(1) {
            warn!(error = %e, "receiver arm failed");
            self.fault(core, SchedulePhase::RangingError, "receiver arm failed");
        }
    }

    fn enter_range_computation(&self, core: &mut SchedulerCore<R, S>) {
        self.set_phase(core, SchedulePhase::RangeComputation);
        core.round.tick_in_phase = 0;
        let measurements = compute_round(core);
        core.stats.rounds_completed += 1;
        core.consecutive_faults = 0;
        if core.round.own_slot.is_some() {
            core.rounds_without_slot = 0;
        } else {
            core.rounds_without_slot += 1;
            if core.rounds_without_slot == core.config.max_round_faults {
                warn!("no slot assignment after repeated rounds, declaring the network lost");
                self.events.post(AppEvent::NetworkLost);
            }
        }
        core.last_results = measurements.clone();
        core.stats.measurements_produced += measurements.len() as u32;
        if !measurements.is_empty() {
            debug!(
                round = core.round.index,
                count = measurements.len(),
                "round produced measurements"
            );
            let round = core.round.index;
            core.sink.ranges_complete(round, measurements.as_slice());
        }
    }

    fn enter_unscheduled(&self, core: &mut SchedulerCore<R, S>) {
        self.set_phase(core, SchedulePhase::UnscheduledTime);
        core.round.tick_in_phase = 0;
        core.radio.cancel();
    }

    fn tick_unscheduled(&self, core: &mut SchedulerCore<R, S>) {
        if core.round.tick_in_phase < core.config.unscheduled_ticks {
            return;
        }
        if core.pending.is_empty() {
            self.enter_schedule(core);
        } else {
            self.enter_updating_schedule(core);
        }
    }

    /// The only place the live slot table grows.
    fn enter_updating_schedule(&self, core: &mut SchedulerCore<R, S>) {
        self.set_phase(core, SchedulePhase::UpdatingSchedule);
        core.round.tick_in_phase = 0;
        let queued = core.pending.clone();
        core.pending.clear();
        let mut merged = 0;
        for id in &queued {
            if core.slots.contains(id) {
                continue;
            }
            if core.slots.push(*id).is_err() {
                warn!(%id, "slot table full, dropping enrollment");
            } else {
                merged += 1;
            }
        }
        if merged > 0 {
            core.stats.merges_applied += 1;
            debug!(merged, network_size = core.slots.len(), "schedule updated");
        }
    }

    // Radio event handling.

    fn handle_tx_complete(&self, core: &mut SchedulerCore<R, S>, timestamp: RadioTimestamp) {
        if !core.round.tx_pending {
            self.fault(
                core,
                SchedulePhase::RangingError,
                "transmit completion with nothing pending",
            );
            return;
        }
        core.round.tx_pending = false;
        match core.phase {
            SchedulePhase::Schedule => {
                // The master's broadcast is out; the round is rolling.
                self.enter_ranging(core);
            }
            SchedulePhase::Ranging => {
                // Prefer the radio's reported departure time over the plan.
                core.round.our_tx_timestamp = Some(timestamp);
            }
            _ => {}
        }
    }

    fn handle_rx_complete(
        &self,
        core: &mut SchedulerCore<R, S>,
        frame: &FrameBuf,
        timestamp: RadioTimestamp,
    ) {
        let bytes = frame.as_slice();
        let tag = match peek_tag(bytes) {
            Ok(tag) => tag,
            Err(_) => {
                core.stats.frames_dropped += 1;
                return;
            }
        };
        match tag {
            PacketTag::Schedule => self.handle_schedule_frame(core, bytes),
            PacketTag::Ranging => self.handle_ranging_frame(core, bytes, timestamp),
            PacketTag::StatusSuccess => self.handle_status_frame(core, bytes),
            PacketTag::Unknown => {
                core.stats.frames_dropped += 1;
            }
        }
    }

    /// A schedule broadcast adopts the master's table and (re)starts the
    /// round, whatever phase we were in; hearing one as master means another
    /// master owns the air.
    fn handle_schedule_frame(&self, core: &mut SchedulerCore<R, S>, bytes: &[u8]) {
        if core.role == RangingRole::Master {
            self.fault(
                core,
                SchedulePhase::MessageCollision,
                "foreign schedule broadcast",
            );
            return;
        }
        let frame = match ScheduleFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(_) => {
                core.stats.frames_dropped += 1;
                return;
            }
        };
        if frame.slots.is_empty() {
            core.stats.frames_dropped += 1;
            return;
        }
        core.slots = frame.slots;
        core.round.begin(frame.round);
        let own_id = core.own_id;
        core.round.own_slot = core.slots.iter().position(|id| *id == own_id);
        self.enter_ranging(core);
    }

    fn handle_ranging_frame(
        &self,
        core: &mut SchedulerCore<R, S>,
        bytes: &[u8],
        timestamp: RadioTimestamp,
    ) {
        if core.phase != SchedulePhase::Ranging {
            self.fault(
                core,
                SchedulePhase::RangingError,
                "ranging frame outside the ranging phase",
            );
            return;
        }
        if core.round.rx_seen_this_slot {
            self.fault(
                core,
                SchedulePhase::MessageCollision,
                "second transmitter in one slot",
            );
            return;
        }
        let frame = match RangingFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(_) => {
                core.stats.frames_dropped += 1;
                return;
            }
        };
        let cursor = core.round.slot_cursor;
        if frame.slot as usize != cursor {
            self.fault(core, SchedulePhase::RangingError, "frame from the wrong slot");
            return;
        }
        if core.round.own_slot == Some(cursor) {
            self.fault(
                core,
                SchedulePhase::MessageCollision,
                "transmission in our assigned slot",
            );
            return;
        }
        core.round.rx_seen_this_slot = true;
        core.round.heard_mask |= 1 << cursor;
        let own_slot = core.round.own_slot;
        let record = &mut core.round.slots[cursor];
        record.heard = true;
        record.peer_tx = frame.tx_timestamp;
        record.our_rx = timestamp;
        record.echo_of_us = own_slot.and_then(|own| {
            frame
                .echoes
                .iter()
                .find(|echo| echo.slot as usize == own)
                .map(|echo| echo.rx_timestamp)
        });
    }

    fn handle_status_frame(&self, core: &mut SchedulerCore<R, S>, bytes: &[u8]) {
        if core.phase != SchedulePhase::RangeStatus {
            self.fault(
                core,
                SchedulePhase::RangingError,
                "status frame outside the status phase",
            );
            return;
        }
        if core.round.rx_seen_this_slot {
            self.fault(
                core,
                SchedulePhase::MessageCollision,
                "second transmitter in one slot",
            );
            return;
        }
        let frame = match StatusFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(_) => {
                core.stats.frames_dropped += 1;
                return;
            }
        };
        let cursor = core.round.slot_cursor;
        if frame.slot as usize != cursor {
            self.fault(core, SchedulePhase::RangingError, "frame from the wrong slot");
            return;
        }
        if core.round.own_slot == Some(cursor) {
            self.fault(
                core,
                SchedulePhase::MessageCollision,
                "transmission in our assigned slot",
            );
            return;
        }
        core.round.rx_seen_this_slot = true;
        core.round.slots[cursor].status_mask = Some(frame.heard_mask);
    }

    /// Divert the round to a fault phase. The next timer tick opens a fresh
    /// round in the schedule phase; nothing recorded so far survives.
    fn fault(&self, core: &mut SchedulerCore<R, S>, kind: SchedulePhase, reason: &'static str) {
        debug_assert!(matches!(
            kind,
            SchedulePhase::RangingError | SchedulePhase::MessageCollision
        ));
        warn!(round = core.round.index, phase = ?core.phase, reason, "round fault");
        core.last_fault.clear();
        let _ = core.last_fault.try_push_str(reason);
        core.radio.cancel();
        core.round.tx_pending = false;
        self.set_phase(core, kind);
        core.round.tick_in_phase = 0;
        core.stats.rounds_faulted += 1;
        if kind == SchedulePhase::MessageCollision {
            core.stats.collisions += 1;
        }
        core.consecutive_faults += 1;
        if core.consecutive_faults == core.config.max_round_faults {
            warn!("consecutive round faults exhausted, declaring the network lost");
            self.events.post(AppEvent::NetworkLost);
        }
    }
}

/// Turn this round's closed exchanges into distances.
///
/// Each unordered pair is computed once, by the earlier-slot device: only it
/// holds all four timestamps after the later slot echoes its poll. A pair
/// counts only when the peer's frame was heard, it echoed our poll, and its
/// status report confirms it heard our slot.
fn compute_round<R, S>(core: &SchedulerCore<R, S>) -> Vec<RangeMeasurement, MAX_NETWORK_SIZE> {
    let mut out = Vec::new();
    let (Some(own), Some(poll_tx)) = (core.round.own_slot, core.round.our_tx_timestamp) else {
        return out;
    };
    for slot in (own + 1)..core.slots.len() {
        let record = &core.round.slots[slot];
        if !record.heard {
            continue;
        }
        let Some(poll_rx) = record.echo_of_us else {
            continue;
        };
        let confirmed = record
            .status_mask
            .is_some_and(|mask| mask & (1 << own) != 0);
        if !confirmed {
            continue;
        }
        let exchange = TwoWayExchange {
            poll_tx,
            poll_rx,
            resp_tx: record.peer_tx,
            resp_rx: record.our_rx,
        };
        let Some(distance_mm) = exchange.distance_mm() else {
            continue;
        };
        let _ = out.push(RangeMeasurement {
            peer: core.slots[slot],
            distance_mm,
        });
    }
    out
}
