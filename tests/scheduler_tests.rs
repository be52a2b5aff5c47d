use std::sync::{Arc, Mutex};

use rangetag::events::EventFlags;
use rangetag::protocol::{EchoEntry, FrameBuf, RangingFrame, ScheduleFrame, StatusFrame};
use rangetag::radio::{RadioDriver, RadioError, RadioEvent};
use rangetag::ranging::{ticks_to_mm, RadioTimestamp};
use rangetag::scheduler::{RangeSink, RangingScheduler, SchedulePhase};
use rangetag::types::{DeviceId, RangeMeasurement, RangingRole};

#[derive(Default)]
struct RadioLog {
    /// Frame bytes plus the departure tick for delayed transmissions.
    transmitted: Vec<(Vec<u8>, Option<u64>)>,
    receive_arms: Vec<u32>,
    cancels: u32,
    clock: u64,
}

#[derive(Clone)]
struct ScriptRadio {
    log: Arc<Mutex<RadioLog>>,
}

impl ScriptRadio {
    fn new() -> (Self, Arc<Mutex<RadioLog>>) {
        let log = Arc::new(Mutex::new(RadioLog::default()));
        (
            Self {
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl RadioDriver for ScriptRadio {
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
        self.log
            .lock()
            .unwrap()
            .transmitted
            .push((frame.to_vec(), None));
        Ok(())
    }

    fn transmit_delayed(&mut self, frame: &[u8], at: RadioTimestamp) -> Result<(), RadioError> {
        self.log
            .lock()
            .unwrap()
            .transmitted
            .push((frame.to_vec(), Some(at.ticks())));
        Ok(())
    }

    fn start_receive(&mut self, timeout_ticks: u32) -> Result<(), RadioError> {
        self.log.lock().unwrap().receive_arms.push(timeout_ticks);
        Ok(())
    }

    fn cancel(&mut self) {
        self.log.lock().unwrap().cancels += 1;
    }

    fn read_clock(&mut self) -> RadioTimestamp {
        RadioTimestamp::new(self.log.lock().unwrap().clock)
    }
}

#[derive(Clone, Default)]
struct CaptureSink {
    rounds: Arc<Mutex<Vec<(u32, Vec<RangeMeasurement>)>>>,
}

impl RangeSink for CaptureSink {
    fn ranges_complete(&mut self, round: u32, measurements: &[RangeMeasurement]) {
        self.rounds
            .lock()
            .unwrap()
            .push((round, measurements.to_vec()));
    }
}

type TestScheduler = RangingScheduler<ScriptRadio, CaptureSink>;

fn create_scheduler(own: DeviceId) -> (TestScheduler, Arc<Mutex<RadioLog>>, CaptureSink) {
    let (radio, log) = ScriptRadio::new();
    let sink = CaptureSink::default();
    let scheduler = RangingScheduler::new(own, radio, sink.clone(), Arc::new(EventFlags::new()));
    (scheduler, log, sink)
}

fn tick(scheduler: &TestScheduler, count: u32) {
    for _ in 0..count {
        scheduler.on_timer_tick();
    }
}

fn rx(scheduler: &TestScheduler, bytes: &[u8], timestamp: u64) {
    let frame = FrameBuf::from_slice(bytes).unwrap();
    scheduler.on_radio_event(RadioEvent::RxComplete {
        frame,
        timestamp: RadioTimestamp::new(timestamp),
    });
}

fn tx_complete(scheduler: &TestScheduler, timestamp: u64) {
    scheduler.on_radio_event(RadioEvent::TxComplete {
        timestamp: RadioTimestamp::new(timestamp),
    });
}

fn last_transmitted(log: &Arc<Mutex<RadioLog>>) -> (Vec<u8>, Option<u64>) {
    log.lock().unwrap().transmitted.last().cloned().unwrap()
}

#[test]
fn test_master_two_device_round_produces_exact_distance() {
    let own = DeviceId::from_serial(0x01);
    let peer = DeviceId::from_serial(0x02);
    let (scheduler, log, sink) = create_scheduler(own);

    scheduler.run(RangingRole::Master, 0).unwrap();
    scheduler.add_device(peer).unwrap();

    // Round 1: the broadcast carries only the master.
    let (bytes, _) = last_transmitted(&log);
    let broadcast = ScheduleFrame::decode(&bytes).unwrap();
    assert_eq!(broadcast.round, 1);
    assert_eq!(broadcast.slots.as_slice(), &[own]);

    // Broadcast completion opens the ranging phase; our own slot goes out as
    // a delayed transmission whose embedded stamp matches the departure tick.
    log.lock().unwrap().clock = 1_000_000;
    tx_complete(&scheduler, 500);
    assert_eq!(scheduler.get_phase(), SchedulePhase::Ranging);
    let (bytes, delayed_at) = last_transmitted(&log);
    let poll = RangingFrame::decode(&bytes).unwrap();
    assert_eq!(poll.slot, 0);
    assert_eq!(Some(poll.tx_timestamp.ticks()), delayed_at);
    assert!(poll.echoes.is_empty());
    tx_complete(&scheduler, poll.tx_timestamp.ticks());

    // Lone round: ranging, status, computation, idle gap, then the pending
    // enrollment is merged and round 2 is announced.
    tick(&scheduler, 2);
    assert_eq!(scheduler.get_phase(), SchedulePhase::RangeStatus);
    tx_complete(&scheduler, 600);
    tick(&scheduler, 2);
    assert_eq!(scheduler.get_phase(), SchedulePhase::RangeComputation);
    tick(&scheduler, 1);
    assert_eq!(scheduler.get_phase(), SchedulePhase::UnscheduledTime);
    tick(&scheduler, 2);
    assert_eq!(scheduler.get_phase(), SchedulePhase::UpdatingSchedule);
    tick(&scheduler, 1);
    assert_eq!(scheduler.get_phase(), SchedulePhase::Schedule);

    let (bytes, _) = last_transmitted(&log);
    let broadcast = ScheduleFrame::decode(&bytes).unwrap();
    assert_eq!(broadcast.round, 2);
    assert_eq!(broadcast.slots.as_slice(), &[own, peer]);

    // Round 2, slot 0: our poll departs at a known tick.
    log.lock().unwrap().clock = 5_000_000;
    tx_complete(&scheduler, 700);
    let (bytes, delayed_at) = last_transmitted(&log);
    let poll = RangingFrame::decode(&bytes).unwrap();
    let poll_tx = poll.tx_timestamp.ticks();
    assert_eq!(Some(poll_tx), delayed_at);
    tx_complete(&scheduler, poll_tx);

    // Slot 1: the peer answers. Its clock runs a large offset ahead of ours;
    // the offset must fall out of the distance math entirely.
    let tof = 1_000u64;
    let offset = 123_456_789_000u64;
    let reply_delay = 777_000u64;
    let poll_rx_peer = poll_tx + tof + offset;
    let resp_tx_peer = poll_rx_peer + reply_delay;
    let resp_rx_us = poll_tx + 2 * tof + reply_delay;

    tick(&scheduler, 2);
    let mut echoes = heapless::Vec::<EchoEntry, { rangetag::protocol::MAX_ECHOES }>::new();
    echoes
        .push(EchoEntry {
            slot: 0,
            rx_timestamp: RadioTimestamp::new(poll_rx_peer),
        })
        .unwrap();
    let response = RangingFrame {
        slot: 1,
        tx_timestamp: RadioTimestamp::new(resp_tx_peer),
        echoes,
    };
    rx(&scheduler, response.encode().as_slice(), resp_rx_us);

    // Status phase: our report says we heard slot 1, the peer's confirms it
    // heard slot 0.
    tick(&scheduler, 2);
    assert_eq!(scheduler.get_phase(), SchedulePhase::RangeStatus);
    let (bytes, _) = last_transmitted(&log);
    let status = StatusFrame::decode(&bytes).unwrap();
    assert_eq!(status.slot, 0);
    assert_eq!(status.heard_mask, 0b10);
    tx_complete(&scheduler, 800);

    tick(&scheduler, 2);
    let peer_status = StatusFrame {
        slot: 1,
        heard_mask: 0b01,
    };
    rx(&scheduler, peer_status.encode().as_slice(), 900);

    tick(&scheduler, 2);
    assert_eq!(scheduler.get_phase(), SchedulePhase::RangeComputation);

    let rounds = sink.rounds.lock().unwrap();
    assert_eq!(rounds.len(), 1);
    let (round, measurements) = &rounds[0];
    assert_eq!(*round, 2);
    assert_eq!(measurements.len(), 1);
    assert_eq!(measurements[0].peer, peer);
    assert_eq!(measurements[0].distance_mm, ticks_to_mm(tof as i64));
    drop(rounds);

    let stats = scheduler.get_stats();
    assert_eq!(stats.rounds_completed, 2);
    assert_eq!(stats.measurements_produced, 1);
    assert_eq!(stats.rounds_faulted, 0);
}

#[test]
fn test_participant_adopts_broadcast_and_echoes_arrival_times() {
    let own = DeviceId::from_serial(0x22);
    let master = DeviceId::from_serial(0x11);
    let (scheduler, log, _sink) = create_scheduler(own);

    scheduler.run(RangingRole::Participant, 0).unwrap();
    assert_eq!(log.lock().unwrap().receive_arms.as_slice(), &[4]);

    // Adopt the announced table wholesale, slot assignment included.
    let announce = ScheduleFrame {
        round: 7,
        slots: heapless::Vec::from_slice(&[master, own]).unwrap(),
    };
    rx(&scheduler, announce.encode().as_slice(), 100);
    assert_eq!(scheduler.get_phase(), SchedulePhase::Ranging);
    assert_eq!(scheduler.get_round_index(), 7);
    assert_eq!(scheduler.get_slot_table().as_slice(), &[master, own]);

    // Slot 0: the master's poll arrives; its arrival tick is what our own
    // frame must echo back.
    let master_poll = RangingFrame {
        slot: 0,
        tx_timestamp: RadioTimestamp::new(42_000),
        echoes: heapless::Vec::new(),
    };
    let our_arrival = 987_654_321u64;
    rx(&scheduler, master_poll.encode().as_slice(), our_arrival);

    // Slot 1 is ours.
    log.lock().unwrap().clock = 9_000_000;
    tick(&scheduler, 2);
    let (bytes, delayed_at) = last_transmitted(&log);
    let ours = RangingFrame::decode(&bytes).unwrap();
    assert_eq!(ours.slot, 1);
    assert_eq!(Some(ours.tx_timestamp.ticks()), delayed_at);
    assert_eq!(ours.echoes.len(), 1);
    assert_eq!(ours.echoes[0].slot, 0);
    assert_eq!(ours.echoes[0].rx_timestamp.ticks(), our_arrival);
}

#[test]
fn test_collision_condemns_round_and_next_broadcast_recovers() {
    let own = DeviceId::from_serial(0x22);
    let master = DeviceId::from_serial(0x11);
    let third = DeviceId::from_serial(0x33);
    let (scheduler, _log, _sink) = create_scheduler(own);

    scheduler.run(RangingRole::Participant, 0).unwrap();
    let announce = ScheduleFrame {
        round: 3,
        slots: heapless::Vec::from_slice(&[master, third, own]).unwrap(),
    };
    rx(&scheduler, announce.encode().as_slice(), 100);

    // Two different frames inside one slot window is a collision.
    let first = RangingFrame {
        slot: 0,
        tx_timestamp: RadioTimestamp::new(1_000),
        echoes: heapless::Vec::new(),
    };
    let second = RangingFrame {
        slot: 0,
        tx_timestamp: RadioTimestamp::new(2_000),
        echoes: heapless::Vec::new(),
    };
    rx(&scheduler, first.encode().as_slice(), 5_000);
    rx(&scheduler, second.encode().as_slice(), 6_000);
    assert_eq!(scheduler.get_phase(), SchedulePhase::MessageCollision);
    assert_eq!(scheduler.get_stats().collisions, 1);
    assert_eq!(scheduler.get_stats().rounds_faulted, 1);
    assert!(!scheduler.get_last_fault().is_empty());

    // Late completions during the condemned round are ignored.
    tx_complete(&scheduler, 7_000);
    assert_eq!(scheduler.get_phase(), SchedulePhase::MessageCollision);

    // One tick flushes the fault, the next broadcast is adopted normally.
    tick(&scheduler, 1);
    assert_eq!(scheduler.get_phase(), SchedulePhase::Schedule);
    let announce = ScheduleFrame {
        round: 4,
        slots: heapless::Vec::from_slice(&[master, own]).unwrap(),
    };
    rx(&scheduler, announce.encode().as_slice(), 8_000);
    assert_eq!(scheduler.get_phase(), SchedulePhase::Ranging);
    assert_eq!(scheduler.get_round_index(), 4);
    assert!(scheduler.is_active());
}
