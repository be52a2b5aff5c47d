//! Application task: the event dispatch loop and everything it drives.
//!
//! One [`TagContext`] + [`TagApp`] pair is one logical device. The context is
//! the interrupt-facing half: transport and sensor callbacks record their
//! observations there and post event bits. The app is the task-facing half: a
//! single cooperative consumer that takes the accumulated bits and services
//! every set bit once per wake, running elections, starting and stopping the
//! ranging scheduler, and handling external enrollment requests.
//!
//! Handlers may block for a bounded interval (a discovery window, a locate
//! beep loop); that delays later bits until the next wake but never drops
//! them, since taken bits are exactly the bits handled and new posts
//! accumulate meanwhile.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::election::elect;
use crate::events::{AppEvent, EventFlags};
use crate::link::{LinkError, LinkTransport};
use crate::peers::{ObserveOutcome, PeerTable};
use crate::radio::{self, RadioDriver, RadioError};
use crate::scheduler::{RangeSink, RangingScheduler, SchedulerConfig};
use crate::types::{DeviceId, DiscoveredPeer, RangeMeasurement, RangingRole, MAX_NETWORK_SIZE};

/// Default bounded window for the forwarding discovery scan.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_secs(1);

/// Default pause between locate beeps.
pub const DEFAULT_FIND_MY_BEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How often the blocking dispatch loop re-checks its shutdown flag.
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub discovery_window: Duration,
    pub find_my_beep_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            discovery_window: DEFAULT_DISCOVERY_WINDOW,
            find_my_beep_interval: DEFAULT_FIND_MY_BEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AppStats {
    pub elections: u32,
    pub joins_attempted: u32,
    pub joins_completed: u32,
    pub enroll_requests: u32,
    pub forwards_attempted: u32,
    pub forwards_completed: u32,
    pub find_my_beeps: u32,
}

/// Storage and indicator boundary.
///
/// Calls arrive from the app task and, for [`Platform::record_round`], from
/// the scheduler's critical section; implementations must not block.
pub trait Platform {
    /// Persist one completed round's distances.
    fn record_round(&mut self, round: u32, measurements: &[RangeMeasurement]);
    /// Battery is critical: flush pending state and shut storage down.
    fn flush_and_shutdown(&mut self);
    fn write_motion_status(&mut self, moving: bool);
    /// One audible/visible locate pulse.
    fn indicate_location(&mut self);
}

impl<P: Platform> RangeSink for Arc<Mutex<P>> {
    fn ranges_complete(&mut self, round: u32, measurements: &[RangeMeasurement]) {
        self.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_round(round, measurements);
    }
}

/// Interrupt-facing half of one device: shared observation state and the
/// event-flag register. Transport and sensor callbacks land here.
pub struct TagContext {
    own_id: DeviceId,
    events: Arc<EventFlags>,
    peers: Mutex<PeerTable>,
    /// Last-writer-wins enrollment target for the next SCHEDULE_DEVICE wake.
    schedule_target: Mutex<Option<DeviceId>>,
    find_my_seconds: AtomicU32,
}

impl TagContext {
    pub fn new(own_id: DeviceId) -> Self {
        Self {
            own_id,
            events: Arc::new(EventFlags::new()),
            peers: Mutex::new(PeerTable::new()),
            schedule_target: Mutex::new(None),
            find_my_seconds: AtomicU32::new(0),
        }
    }

    pub fn own_id(&self) -> DeviceId {
        self.own_id
    }

    pub fn events(&self) -> &Arc<EventFlags> {
        &self.events
    }

    fn lock_peers(&self) -> MutexGuard<'_, PeerTable> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One advertisement observed by the transport. The returned outcome
    /// tells the transport whether this opened a new window (arm the window
    /// timer) or the table is already full.
    pub fn on_peer_discovered(&self, id: DeviceId, role: RangingRole) -> ObserveOutcome {
        let outcome = self.lock_peers().observe(id, role);
        if outcome == ObserveOutcome::TableFull {
            debug!(%id, "peer table full, observation dropped");
        }
        outcome
    }

    /// Background discovery window expired; hand the results to the loop.
    pub fn on_discovery_window_closed(&self) {
        let observed = {
            let mut peers = self.lock_peers();
            peers.end_window();
            peers.len()
        };
        if observed > 0 {
            self.events.post(AppEvent::NetworkFound);
        } else {
            self.events.post(AppEvent::VerifyConfiguration);
        }
    }

    /// Foreground-scan variant of window closure: observations are left for
    /// the scanning caller to consume and no event is posted.
    pub fn on_foreground_scan_complete(&self) {
        self.lock_peers().end_window();
    }

    pub fn peer_snapshot(&self) -> Vec<DiscoveredPeer, MAX_NETWORK_SIZE> {
        self.lock_peers().snapshot()
    }

    /// Queue an enrollment request for `target`. A newer request arriving
    /// before the loop wakes replaces the target.
    pub fn request_schedule_device(&self, target: DeviceId) {
        *self
            .schedule_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(target);
        self.events.post(AppEvent::ScheduleDevice);
    }

    pub fn request_find_my(&self, seconds: u32) {
        self.find_my_seconds.store(seconds, Ordering::Release);
        self.events.post(AppEvent::FindMyTag);
    }

    pub fn post_battery_event(&self) {
        self.events.post(AppEvent::BatteryEvent);
    }

    fn take_schedule_target(&self) -> Option<DeviceId> {
        self.schedule_target
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn take_find_my_seconds(&self) -> u32 {
        self.find_my_seconds.swap(0, Ordering::AcqRel)
    }
}

/// Task-facing half of one device: owns the transport, the scheduler, and
/// the platform handle, and services the event loop.
pub struct TagApp<L, R, P> {
    context: Arc<TagContext>,
    link: Mutex<L>,
    scheduler: Arc<RangingScheduler<R, Arc<Mutex<P>>>>,
    platform: Arc<Mutex<P>>,
    role: Mutex<RangingRole>,
    time_reference: AtomicU64,
    forward_in_flight: AtomicBool,
    config: AppConfig,
    stats: Mutex<AppStats>,
}

impl<L: LinkTransport, R: RadioDriver, P: Platform> TagApp<L, R, P> {
    /// Bring the radio up and assemble the device. Fails only when the radio
    /// stays unresponsive through the whole recovery ladder.
    pub fn new(
        context: Arc<TagContext>,
        link: L,
        mut radio: R,
        platform: Arc<Mutex<P>>,
        config: AppConfig,
    ) -> Result<Self, RadioError> {
        radio::bring_up(&mut radio)?;
        let scheduler = Arc::new(RangingScheduler::with_config(
            context.own_id(),
            radio,
            Arc::clone(&platform),
            Arc::clone(context.events()),
            config.scheduler,
        ));
        Ok(Self {
            context,
            link: Mutex::new(link),
            scheduler,
            platform,
            role: Mutex::new(RangingRole::Unknown),
            time_reference: AtomicU64::new(0),
            forward_in_flight: AtomicBool::new(false),
            config,
            stats: Mutex::new(AppStats::default()),
        })
    }

    fn lock_link(&self) -> MutexGuard<'_, L> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_platform(&self) -> MutexGuard<'_, P> {
        self.platform.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, AppStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put the link interface into its idle posture: advertising, scanning.
    pub fn boot(&self) {
        self.reconcile_configuration();
        debug!(id = %self.context.own_id(), "application task ready");
    }

    /// Drain and service whatever is pending, without blocking. Returns the
    /// bits that were handled.
    pub fn handle_pending(&self) -> u32 {
        let bits = self.context.events().take();
        if bits != 0 {
            self.handle(bits);
        }
        bits
    }

    /// Blocking dispatch loop; returns once `running` is cleared.
    pub fn run_until(&self, running: &AtomicBool) {
        while running.load(Ordering::Acquire) {
            let bits = self.context.events().wait_timeout(RUN_POLL_INTERVAL);
            if bits != 0 {
                self.handle(bits);
            }
        }
    }

    /// Service every set bit once, in a fixed order.
    pub fn handle(&self, bits: u32) {
        for event in AppEvent::ALL {
            if !event.is_set(bits) {
                continue;
            }
            match event {
                AppEvent::NetworkLost => self.on_network_lost(),
                AppEvent::VerifyConfiguration => self.reconcile_configuration(),
                AppEvent::NetworkFound => self.on_network_found(),
                AppEvent::BatteryEvent => self.on_battery_event(),
                AppEvent::FindMyTag => self.on_find_my(),
                AppEvent::ScheduleDevice => self.on_schedule_device(),
            }
        }
    }

    pub fn context(&self) -> &Arc<TagContext> {
        &self.context
    }

    pub fn scheduler(&self) -> &Arc<RangingScheduler<R, Arc<Mutex<P>>>> {
        &self.scheduler
    }

    pub fn get_role(&self) -> RangingRole {
        *self.role.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adopt and advertise a role. Also the power-management override path
    /// (entering or leaving [`RangingRole::Asleep`]).
    pub fn set_role(&self, role: RangingRole) {
        *self.role.lock().unwrap_or_else(PoisonError::into_inner) = role;
        self.lock_link().set_advertised_role(role);
        debug!(id = %self.context.own_id(), role = ?role, "role changed");
    }

    pub fn get_stats(&self) -> AppStats {
        *self.lock_stats()
    }

    /// Entry point for an externally requested enrollment.
    pub fn schedule_device(&self, target: DeviceId) {
        self.context.request_schedule_device(target);
    }

    /// Record the management-side time origin used to anchor rounds.
    pub fn set_time_reference(&self, epoch: u64) {
        self.time_reference.store(epoch, Ordering::Release);
    }

    pub fn get_time_reference(&self) -> u64 {
        self.time_reference.load(Ordering::Acquire)
    }

    /// Motion callback: written through to storage without waking the loop.
    pub fn on_motion_changed(&self, moving: bool) {
        self.lock_platform().write_motion_status(moving);
    }

    fn on_network_lost(&self) {
        info!(id = %self.context.own_id(), "network lost, returning to discovery");
        self.scheduler.stop();
        self.set_role(RangingRole::Unknown);
        self.reconcile_configuration();
        if let Err(e) = self.lock_link().reset_scanning() {
            debug!(error = %e, "scan restart failed");
        }
    }

    /// Reconcile the advertised role and link posture with the scheduler
    /// state: a role with no running session is stale, advertising is always
    /// wanted, and the device scans exactly when it is not ranging.
    fn reconcile_configuration(&self) {
        let active = self.scheduler.is_active();
        let role = self.get_role();
        if !active && !matches!(role, RangingRole::Unknown | RangingRole::Asleep) {
            self.set_role(RangingRole::Unknown);
        }
        let mut link = self.lock_link();
        if let Err(e) = link.start_advertising() {
            debug!(error = %e, "advertising start failed");
        }
        let result = if active {
            link.stop_scanning()
        } else {
            link.start_scanning()
        };
        if let Err(e) = result {
            debug!(error = %e, "scan state change failed");
        }
    }

    fn on_network_found(&self) {
        if self.get_role() == RangingRole::Asleep {
            return;
        }
        if self.scheduler.is_active() {
            debug!("ignoring discovery results while ranging");
            return;
        }
        let peers = self.context.peer_snapshot();
        let outcome = elect(self.context.own_id(), &peers);
        self.lock_stats().elections += 1;
        debug!(
            id = %self.context.own_id(),
            observed = peers.len(),
            role = ?outcome.role,
            joins = outcome.joins.len(),
            "election decided"
        );

        let Some(role) = outcome.role else {
            // No candidate. Restart the scan so a lower-id peer that just
            // claimed mastership is observed promptly.
            if let Err(e) = self.lock_link().reset_scanning() {
                debug!(error = %e, "scan restart failed");
            }
            return;
        };

        self.set_role(role);
        let mut completed = 0u32;
        for target in &outcome.joins {
            self.lock_stats().joins_attempted += 1;
            match self.lock_link().join(*target, None) {
                Ok(()) => {
                    completed += 1;
                    self.lock_stats().joins_completed += 1;
                }
                Err(e) => debug!(target = %target, error = %e, "join attempt abandoned"),
            }
        }
        if completed == 0 {
            // Every join lapsed; stay a discovery candidate for the next
            // window instead of ranging into silence.
            self.set_role(RangingRole::Unknown);
            self.reconcile_configuration();
            return;
        }

        let origin = self.get_time_reference();
        if let Err(e) = self.scheduler.run(role, origin) {
            warn!(error = %e, "scheduler start failed");
            self.set_role(RangingRole::Unknown);
        }
        self.reconcile_configuration();
    }

    fn on_battery_event(&self) {
        info!(id = %self.context.own_id(), "battery critical, flushing state");
        self.lock_platform().flush_and_shutdown();
    }

    /// Bounded locate loop: one pulse per requested second. Deliberately
    /// blocks this loop iteration; pending bits are serviced on return.
    fn on_find_my(&self) {
        let seconds = self.context.take_find_my_seconds();
        if seconds == 0 {
            return;
        }
        info!(id = %self.context.own_id(), seconds, "locate request");
        for _ in 0..seconds {
            self.lock_platform().indicate_location();
            self.lock_stats().find_my_beeps += 1;
            thread::sleep(self.config.find_my_beep_interval);
        }
    }

    fn on_schedule_device(&self) {
        let Some(target) = self.context.take_schedule_target() else {
            return;
        };
        self.lock_stats().enroll_requests += 1;
        if self.get_role() == RangingRole::Asleep {
            debug!(%target, "ignoring enrollment request while asleep");
            return;
        }
        if !self.scheduler.is_active() {
            // Nobody is scheduling rounds here yet; claim mastership.
            self.set_role(RangingRole::Master);
            let origin = self.get_time_reference();
            if let Err(e) = self.scheduler.run(RangingRole::Master, origin) {
                warn!(error = %e, "scheduler start failed");
                return;
            }
            self.reconcile_configuration();
        }
        if self.get_role() == RangingRole::Master {
            match self.scheduler.add_device(target) {
                Ok(()) => debug!(%target, "device queued for enrollment"),
                Err(e) => warn!(%target, error = %e, "enrollment rejected"),
            }
        } else {
            self.forward_schedule_request(target);
        }
    }

    /// Forward an enrollment request to a master, with at most one attempt
    /// in flight. The request lapses silently when no master turns up inside
    /// the discovery window.
    fn forward_schedule_request(&self, target: DeviceId) {
        if self.forward_in_flight.swap(true, Ordering::AcqRel) {
            debug!(%target, "forward already in flight, dropping request");
            return;
        }
        self.lock_stats().forwards_attempted += 1;
        let result = self.try_forward(target);
        self.forward_in_flight.store(false, Ordering::Release);
        match result {
            Ok(master) => {
                self.lock_stats().forwards_completed += 1;
                debug!(%target, %master, "enrollment forwarded");
            }
            Err(e) => debug!(%target, error = %e, "enrollment forward lapsed"),
        }
    }

    fn try_forward(&self, target: DeviceId) -> Result<DeviceId, LinkError> {
        self.lock_link().single_scan(self.config.discovery_window)?;
        let peers = self.context.peer_snapshot();
        let master = peers
            .iter()
            .find(|p| p.role == RangingRole::Master)
            .map(|p| p.id)
            .ok_or(LinkError::JoinTimeout)?;
        self.lock_link().join(master, Some(target))?;
        Ok(master)
    }
}
