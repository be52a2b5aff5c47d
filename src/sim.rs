//! Multi-device in-process simulation.
//!
//! A [`SimNetwork`] wires several complete tag stacks to one shared
//! [`VirtualMedium`]: per-device positions give every frame a propagation
//! delay in radio ticks, per-device clock offsets make the timestamp algebra
//! earn its keep, and advertising/scanning state drives discovery. One
//! [`SimNetwork::step`] is one ranging-timer tick, fanned out in a fixed
//! stage order (discovery, timer ticks, frame delivery, receive timeouts,
//! app-event pumping) so every device observes the same slot boundaries.
//!
//! The simulation backs the integration tests and the `rangetag-sim` binary.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::{AppConfig, Platform, TagApp, TagContext};
use crate::link::{LinkError, LinkTransport};
use crate::protocol::FrameBuf;
use crate::radio::{RadioDriver, RadioError, RadioEvent};
use crate::ranging::{mm_to_ticks, RadioTimestamp, TICKS_PER_SECOND, TICK_MODULUS};
use crate::scheduler::RangingScheduler;
use crate::types::{DeviceId, RangeMeasurement, RangingRole};

/// Radio ticks per simulation step: a 10 ms slot interval.
pub const SIM_TICKS_PER_SLOT: u64 = TICKS_PER_SECOND / 100;

/// Steps a background discovery window stays open before its results are
/// handed to the dispatch loop.
pub const DEFAULT_DISCOVERY_WINDOW_STEPS: u64 = 5;

pub type SimScheduler = RangingScheduler<SimRadio, Arc<Mutex<SimPlatform>>>;
pub type SimApp = TagApp<SimLink, SimRadio, SimPlatform>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimConfig {
    pub seed: u64,
    /// Uniform receive-timestamp jitter, plus or minus, in radio ticks.
    pub noise_ticks: u64,
    pub discovery_window_steps: u64,
    pub slot_ticks: u64,
    pub app: AppConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 0x5eed,
            noise_ticks: 0,
            discovery_window_steps: DEFAULT_DISCOVERY_WINDOW_STEPS,
            slot_ticks: SIM_TICKS_PER_SLOT,
            // Zero durations keep handlers from sleeping inside a step.
            app: AppConfig {
                discovery_window: Duration::ZERO,
                find_my_beep_interval: Duration::ZERO,
                ..AppConfig::default()
            },
        }
    }
}

/// Flat tag position in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x_mm: f64,
    pub y_mm: f64,
}

impl Position {
    pub const fn new(x_mm: f64, y_mm: f64) -> Self {
        Self { x_mm, y_mm }
    }

    pub fn distance_mm(&self, other: &Position) -> f64 {
        let dx = self.x_mm - other.x_mm;
        let dy = self.y_mm - other.y_mm;
        (dx * dx + dy * dy).sqrt()
    }
}

struct PendingTx {
    from: usize,
    frame: FrameBuf,
    /// Departure time on the medium clock.
    physical_ticks: u64,
    /// Sender-clock stamp reported with the TX completion.
    report_ts: RadioTimestamp,
}

struct DeviceCell {
    id: DeviceId,
    context: Arc<TagContext>,
    position: Position,
    /// Device clock = medium clock + offset, modulo the counter width.
    clock_offset: u64,
    rx_deadline: Option<u64>,
    rx_frames_in_window: u32,
    advertising: bool,
    scanning: bool,
    advertised_role: RangingRole,
    window_ends: Option<u64>,
    joins_received: u32,
}

struct MediumInner {
    now_ticks: u64,
    step: u64,
    cells: Vec<DeviceCell>,
    in_flight: Vec<PendingTx>,
    rng: StdRng,
    noise_ticks: u64,
}

impl MediumInner {
    fn device_clock(&self, index: usize) -> u64 {
        (self.now_ticks + self.cells[index].clock_offset) & (TICK_MODULUS - 1)
    }

    fn propagation_ticks(&self, from: usize, to: usize) -> u64 {
        let mm = self.cells[from]
            .position
            .distance_mm(&self.cells[to].position);
        mm_to_ticks(mm.round() as i64) as u64
    }
}

/// Shared virtual air: positions, clocks, frames in flight, advertisements.
pub struct VirtualMedium {
    inner: Mutex<MediumInner>,
}

impl VirtualMedium {
    fn new(seed: u64, noise_ticks: u64) -> Self {
        Self {
            inner: Mutex::new(MediumInner {
                now_ticks: 0,
                step: 0,
                cells: Vec::new(),
                in_flight: Vec::new(),
                rng: StdRng::seed_from_u64(seed),
                noise_ticks,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MediumInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Radio driver backed by the shared medium.
pub struct SimRadio {
    medium: Arc<VirtualMedium>,
    index: usize,
}

impl RadioDriver for SimRadio {
    fn init(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn force_wake(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), RadioError> {
        let Some(frame) = FrameBuf::from_slice(frame) else {
            return Err(RadioError::Fault("frame exceeds the radio buffer"));
        };
        let mut medium = self.medium.lock();
        let physical = medium.now_ticks;
        let offset = medium.cells[self.index].clock_offset;
        medium.in_flight.push(PendingTx {
            from: self.index,
            frame,
            physical_ticks: physical,
            report_ts: RadioTimestamp::new(physical.wrapping_add(offset)),
        });
        Ok(())
    }

    fn transmit_delayed(&mut self, frame: &[u8], at: RadioTimestamp) -> Result<(), RadioError> {
        let Some(frame) = FrameBuf::from_slice(frame) else {
            return Err(RadioError::Fault("frame exceeds the radio buffer"));
        };
        let mut medium = self.medium.lock();
        let device_now = medium.device_clock(self.index);
        let lead = at.ticks_since(RadioTimestamp::new(device_now));
        let physical = medium.now_ticks + lead;
        medium.in_flight.push(PendingTx {
            from: self.index,
            frame,
            physical_ticks: physical,
            report_ts: at,
        });
        Ok(())
    }

    fn start_receive(&mut self, timeout_ticks: u32) -> Result<(), RadioError> {
        let mut medium = self.medium.lock();
        let step = medium.step;
        let cell = &mut medium.cells[self.index];
        cell.rx_deadline = Some(step + u64::from(timeout_ticks));
        cell.rx_frames_in_window = 0;
        Ok(())
    }

    fn cancel(&mut self) {
        let mut medium = self.medium.lock();
        let index = self.index;
        medium.in_flight.retain(|tx| tx.from != index);
        let cell = &mut medium.cells[index];
        cell.rx_deadline = None;
        cell.rx_frames_in_window = 0;
    }

    fn read_clock(&mut self) -> RadioTimestamp {
        let medium = self.medium.lock();
        RadioTimestamp::new(medium.device_clock(self.index))
    }
}

/// Discovery transport backed by the shared medium.
pub struct SimLink {
    medium: Arc<VirtualMedium>,
    index: usize,
    context: Arc<TagContext>,
}

impl LinkTransport for SimLink {
    fn start_advertising(&mut self) -> Result<(), LinkError> {
        self.medium.lock().cells[self.index].advertising = true;
        Ok(())
    }

    fn stop_advertising(&mut self) -> Result<(), LinkError> {
        self.medium.lock().cells[self.index].advertising = false;
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        self.medium.lock().cells[self.index].advertising
    }

    fn start_scanning(&mut self) -> Result<(), LinkError> {
        self.medium.lock().cells[self.index].scanning = true;
        Ok(())
    }

    fn stop_scanning(&mut self) -> Result<(), LinkError> {
        let mut medium = self.medium.lock();
        let cell = &mut medium.cells[self.index];
        cell.scanning = false;
        cell.window_ends = None;
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.medium.lock().cells[self.index].scanning
    }

    fn reset_scanning(&mut self) -> Result<(), LinkError> {
        // Abort any window in progress; the next step opens a fresh one.
        self.medium.lock().cells[self.index].window_ends = None;
        Ok(())
    }

    fn set_advertised_role(&mut self, role: RangingRole) {
        self.medium.lock().cells[self.index].advertised_role = role;
    }

    fn advertised_role(&self) -> RangingRole {
        self.medium.lock().cells[self.index].advertised_role
    }

    fn single_scan(&mut self, _window: Duration) -> Result<(), LinkError> {
        let observed: Vec<(DeviceId, RangingRole)> = {
            let medium = self.medium.lock();
            medium
                .cells
                .iter()
                .enumerate()
                .filter(|(j, cell)| *j != self.index && cell.advertising)
                .map(|(_, cell)| (cell.id, cell.advertised_role))
                .collect()
        };
        for (id, role) in observed {
            self.context.on_peer_discovered(id, role);
        }
        self.context.on_foreground_scan_complete();
        Ok(())
    }

    fn join(&mut self, target: DeviceId, forwarded: Option<DeviceId>) -> Result<(), LinkError> {
        let enrolled = forwarded.unwrap_or_else(|| self.context.own_id());
        let target_context = {
            let mut medium = self.medium.lock();
            let Some(cell) = medium.cells.iter_mut().find(|c| c.id == target) else {
                return Err(LinkError::JoinTimeout);
            };
            cell.joins_received += 1;
            Arc::clone(&cell.context)
        };
        target_context.request_schedule_device(enrolled);
        Ok(())
    }
}

/// Records what the firmware would hand to storage and indicators.
#[derive(Debug, Default)]
pub struct SimPlatform {
    pub rounds: Vec<(u32, Vec<RangeMeasurement>)>,
    pub flushes: u32,
    pub beeps: u32,
    pub motion: Option<bool>,
}

impl SimPlatform {
    /// Most recently recorded distance to `peer`, if any round produced one.
    pub fn last_distance_to(&self, peer: DeviceId) -> Option<i32> {
        self.rounds.iter().rev().find_map(|(_, measurements)| {
            measurements
                .iter()
                .find(|m| m.peer == peer)
                .map(|m| m.distance_mm)
        })
    }
}

impl Platform for SimPlatform {
    fn record_round(&mut self, round: u32, measurements: &[RangeMeasurement]) {
        self.rounds.push((round, measurements.to_vec()));
    }

    fn flush_and_shutdown(&mut self) {
        self.flushes += 1;
    }

    fn write_motion_status(&mut self, motion: bool) {
        self.motion = Some(motion);
    }

    fn indicate_location(&mut self) {
        self.beeps += 1;
    }
}

/// One virtual tag: the full application stack plus assertion handles.
pub struct SimDevice {
    id: DeviceId,
    app: SimApp,
    platform: Arc<Mutex<SimPlatform>>,
}

impl SimDevice {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn app(&self) -> &SimApp {
        &self.app
    }

    pub fn scheduler(&self) -> &Arc<SimScheduler> {
        self.app.scheduler()
    }

    pub fn platform(&self) -> MutexGuard<'_, SimPlatform> {
        self.platform.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A set of virtual tags sharing one medium, stepped in lockstep.
pub struct SimNetwork {
    config: SimConfig,
    medium: Arc<VirtualMedium>,
    devices: Vec<SimDevice>,
}

impl SimNetwork {
    pub fn new(config: SimConfig) -> Self {
        Self {
            medium: Arc::new(VirtualMedium::new(config.seed, config.noise_ticks)),
            devices: Vec::new(),
            config,
        }
    }

    /// Create a tag at `position`, boot it, and return its index.
    pub fn add_tag(&mut self, serial: u64, position: Position) -> Result<usize, RadioError> {
        let id = DeviceId::from_serial(serial);
        let context = Arc::new(TagContext::new(id));
        let index = self.devices.len();
        {
            let mut medium = self.medium.lock();
            let clock_offset = medium.rng.gen_range(0..TICK_MODULUS);
            medium.cells.push(DeviceCell {
                id,
                context: Arc::clone(&context),
                position,
                clock_offset,
                rx_deadline: None,
                rx_frames_in_window: 0,
                advertising: false,
                scanning: false,
                advertised_role: RangingRole::Unknown,
                window_ends: None,
                joins_received: 0,
            });
        }
        let radio = SimRadio {
            medium: Arc::clone(&self.medium),
            index,
        };
        let link = SimLink {
            medium: Arc::clone(&self.medium),
            index,
            context: Arc::clone(&context),
        };
        let platform = Arc::new(Mutex::new(SimPlatform::default()));
        let app = TagApp::new(context, link, radio, Arc::clone(&platform), self.config.app)?;
        app.boot();
        debug!(%id, index, "tag added to the simulation");
        self.devices.push(SimDevice { id, app, platform });
        Ok(index)
    }

    pub fn device(&self, index: usize) -> &SimDevice {
        &self.devices[index]
    }

    pub fn devices(&self) -> &[SimDevice] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn current_step(&self) -> u64 {
        self.medium.lock().step
    }

    pub fn master_count(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| d.app.get_role() == RangingRole::Master)
            .count()
    }

    /// Enrollment requests delivered to a device over the link transport.
    pub fn joins_received(&self, index: usize) -> u32 {
        self.medium.lock().cells[index].joins_received
    }

    /// Advance the whole network by one slot interval.
    pub fn step(&mut self) {
        let step = {
            let mut medium = self.medium.lock();
            medium.step += 1;
            medium.step
        };
        self.open_discovery_windows(step);
        self.close_discovery_windows(step);

        // Periodic ranging-timer fan-out.
        {
            let mut medium = self.medium.lock();
            medium.now_ticks += self.config.slot_ticks;
        }
        for device in &self.devices {
            device.app.scheduler().on_timer_tick();
        }

        self.deliver_frames();
        self.fire_rx_timeouts(step);

        for device in &self.devices {
            device.app.handle_pending();
        }
    }

    pub fn run_steps(&mut self, count: u64) {
        for _ in 0..count {
            self.step();
        }
    }

    /// A scanning device with no open window observes every advertiser once
    /// and opens a window; the window timer runs in steps.
    fn open_discovery_windows(&self, step: u64) {
        let mut openings: Vec<(usize, Vec<(DeviceId, RangingRole)>)> = Vec::new();
        {
            let mut medium = self.medium.lock();
            let advertisers: Vec<(usize, DeviceId, RangingRole)> = medium
                .cells
                .iter()
                .enumerate()
                .filter(|(_, cell)| cell.advertising)
                .map(|(j, cell)| (j, cell.id, cell.advertised_role))
                .collect();
            let window_steps = self.config.discovery_window_steps;
            for (i, cell) in medium.cells.iter_mut().enumerate() {
                if !cell.scanning || cell.window_ends.is_some() {
                    continue;
                }
                let visible: Vec<(DeviceId, RangingRole)> = advertisers
                    .iter()
                    .filter(|(j, _, _)| *j != i)
                    .map(|(_, id, role)| (*id, *role))
                    .collect();
                if visible.is_empty() {
                    continue;
                }
                cell.window_ends = Some(step + window_steps);
                openings.push((i, visible));
            }
        }
        for (i, peers) in openings {
            let context = self.devices[i].app.context();
            for (id, role) in peers {
                context.on_peer_discovered(id, role);
            }
        }
    }

    fn close_discovery_windows(&self, step: u64) {
        let closing: Vec<usize> = {
            let mut medium = self.medium.lock();
            let mut closing = Vec::new();
            for (i, cell) in medium.cells.iter_mut().enumerate() {
                if let Some(end) = cell.window_ends {
                    if end <= step {
                        cell.window_ends = None;
                        closing.push(i);
                    }
                }
            }
            closing
        };
        for i in closing {
            self.devices[i].app.context().on_discovery_window_closed();
        }
    }

    /// Deliver every due frame in departure order: the sender's completion
    /// first, then a timestamped reception at every armed receiver.
    fn deliver_frames(&self) {
        loop {
            let tx = {
                let mut medium = self.medium.lock();
                let now = medium.now_ticks;
                let due = medium
                    .in_flight
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.physical_ticks <= now)
                    .min_by_key(|(_, t)| t.physical_ticks)
                    .map(|(i, _)| i);
                match due {
                    Some(i) => medium.in_flight.remove(i),
                    None => break,
                }
            };

            self.devices[tx.from]
                .app
                .scheduler()
                .on_radio_event(RadioEvent::TxComplete {
                    timestamp: tx.report_ts,
                });

            let deliveries: Vec<(usize, RadioTimestamp)> = {
                let mut medium = self.medium.lock();
                let noise_ticks = medium.noise_ticks as i64;
                let mut out = Vec::new();
                for i in 0..medium.cells.len() {
                    if i == tx.from || medium.cells[i].rx_deadline.is_none() {
                        continue;
                    }
                    let flight = medium.propagation_ticks(tx.from, i);
                    let noise = if noise_ticks == 0 {
                        0
                    } else {
                        medium.rng.gen_range(-noise_ticks..=noise_ticks)
                    };
                    let arrival = i128::from(tx.physical_ticks)
                        + i128::from(flight)
                        + i128::from(medium.cells[i].clock_offset)
                        + i128::from(noise);
                    let masked = arrival.rem_euclid(i128::from(TICK_MODULUS)) as u64;
                    medium.cells[i].rx_frames_in_window += 1;
                    out.push((i, RadioTimestamp::new(masked)));
                }
                out
            };
            for (i, timestamp) in deliveries {
                self.devices[i]
                    .app
                    .scheduler()
                    .on_radio_event(RadioEvent::RxComplete {
                        frame: tx.frame,
                        timestamp,
                    });
            }
        }
    }

    /// A receive window that expired without a single frame raises a timeout.
    fn fire_rx_timeouts(&self, step: u64) {
        let expirations: Vec<(usize, bool)> = {
            let mut medium = self.medium.lock();
            let mut out = Vec::new();
            for (i, cell) in medium.cells.iter_mut().enumerate() {
                let Some(deadline) = cell.rx_deadline else {
                    continue;
                };
                if step >= deadline {
                    out.push((i, cell.rx_frames_in_window == 0));
                    cell.rx_deadline = None;
                    cell.rx_frames_in_window = 0;
                }
            }
            out
        };
        for (i, silent) in expirations {
            if silent {
                self.devices[i]
                    .app
                    .scheduler()
                    .on_radio_event(RadioEvent::RxTimeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_distance() {
        let a = Position::new(0.0, 0.0);
        let b = Position::new(3000.0, 4000.0);
        assert!((a.distance_mm(&b) - 5000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_two_tags_form_a_network_and_measure() {
        let mut net = SimNetwork::new(SimConfig::default());
        let a = net.add_tag(0x0a, Position::new(0.0, 0.0)).unwrap();
        let b = net.add_tag(0x0b, Position::new(2000.0, 0.0)).unwrap();
        net.run_steps(120);

        // The higher id was pushed into mastership by the lower id's join.
        assert_eq!(net.master_count(), 1);
        assert_eq!(net.device(b).app().get_role(), RangingRole::Master);
        assert_eq!(net.device(a).app().get_role(), RangingRole::Participant);
        assert!(net.device(a).scheduler().is_active());
        assert!(net.device(b).scheduler().is_active());

        // The earlier slot (the master) measures the pair.
        let distance = net
            .device(b)
            .platform()
            .last_distance_to(net.device(a).id())
            .expect("no distance recorded");
        assert!(
            (distance - 2000).abs() <= 15,
            "expected about 2000 mm, got {distance}"
        );
    }

    #[test]
    fn test_clock_offsets_do_not_bias_the_measurement() {
        // Same geometry, very different seeds (and so clock offsets).
        for seed in [1u64, 99, 0xdead_beef] {
            let config = SimConfig {
                seed,
                ..SimConfig::default()
            };
            let mut net = SimNetwork::new(config);
            net.add_tag(0x01, Position::new(0.0, 0.0)).unwrap();
            let b = net.add_tag(0x02, Position::new(7500.0, 0.0)).unwrap();
            net.run_steps(120);

            let distance = net
                .device(b)
                .platform()
                .last_distance_to(DeviceId::from_serial(0x01))
                .expect("no distance recorded");
            assert!(
                (distance - 7500).abs() <= 15,
                "seed {seed}: expected about 7500 mm, got {distance}"
            );
        }
    }
}
