use rangetag::sim::{Position, SimConfig, SimNetwork};
use rangetag::types::{DeviceId, RangingRole};

fn measured_between(net: &SimNetwork, i: usize, j: usize) -> Option<i32> {
    // The device in the earlier slot records the pair; accept either side.
    net.device(i)
        .platform()
        .last_distance_to(net.device(j).id())
        .or_else(|| {
            net.device(j)
                .platform()
                .last_distance_to(net.device(i).id())
        })
}

fn assert_distance(net: &SimNetwork, i: usize, j: usize, expected_mm: i32) {
    let measured = measured_between(net, i, j)
        .unwrap_or_else(|| panic!("no measurement between tags {i} and {j}"));
    let error = (measured - expected_mm).abs();
    assert!(
        error <= 15,
        "tags {i} and {j}: expected {expected_mm} mm, measured {measured} mm"
    );
}

fn master_index(net: &SimNetwork) -> usize {
    net.devices()
        .iter()
        .position(|d| d.app().get_role() == RangingRole::Master)
        .expect("no master formed")
}

#[test]
fn test_three_tags_converge_to_one_master_and_measure_all_pairs() {
    let mut net = SimNetwork::new(SimConfig::default());
    let a = net.add_tag(0x01, Position::new(0.0, 0.0)).unwrap();
    let b = net.add_tag(0x02, Position::new(3000.0, 0.0)).unwrap();
    let c = net.add_tag(0x03, Position::new(0.0, 4000.0)).unwrap();

    net.run_steps(800);

    // Cold boot: everyone advertises Unknown, so the joins land on the
    // highest id, which claims mastership when the first one arrives.
    assert_eq!(net.master_count(), 1);
    assert_eq!(net.device(c).app().get_role(), RangingRole::Master);
    assert_eq!(net.device(a).app().get_role(), RangingRole::Participant);
    assert_eq!(net.device(b).app().get_role(), RangingRole::Participant);
    for device in net.devices() {
        assert!(device.scheduler().is_active());
    }
    assert_eq!(net.device(c).scheduler().get_slot_table().len(), 3);

    // 3-4-5 triangle.
    assert_distance(&net, a, b, 3000);
    assert_distance(&net, a, c, 4000);
    assert_distance(&net, b, c, 5000);
}

#[test]
fn test_network_reforms_after_the_master_goes_silent() {
    let mut net = SimNetwork::new(SimConfig::default());
    net.add_tag(0x01, Position::new(0.0, 0.0)).unwrap();
    net.add_tag(0x02, Position::new(2500.0, 0.0)).unwrap();
    let c = net.add_tag(0x03, Position::new(5000.0, 0.0)).unwrap();
    net.run_steps(800);
    assert_eq!(master_index(&net), c);

    // Kill the master's session without telling anyone. The participants
    // burn through their fault budget, declare the network lost, and drag
    // the old master back in through fresh joins.
    net.device(c).scheduler().stop();
    net.run_steps(50);
    let rounds_before = net.device(c).platform().rounds.len();

    net.run_steps(600);

    assert_eq!(net.master_count(), 1);
    assert_eq!(net.device(c).app().get_role(), RangingRole::Master);
    for device in net.devices() {
        assert!(device.scheduler().is_active());
    }
    assert!(
        net.device(c).platform().rounds.len() > rounds_before,
        "no rounds recorded after the restart"
    );
    assert_distance(&net, 0, 1, 2500);
}

#[test]
fn test_schedule_device_request_is_forwarded_to_the_master_exactly_once() {
    let mut net = SimNetwork::new(SimConfig::default());
    net.add_tag(0x01, Position::new(0.0, 0.0)).unwrap();
    net.add_tag(0x02, Position::new(3000.0, 0.0)).unwrap();
    net.add_tag(0x03, Position::new(0.0, 4000.0)).unwrap();
    net.run_steps(800);

    let master = master_index(&net);
    let participant = (0..net.len())
        .find(|i| *i != master)
        .expect("no participant");
    let phantom = DeviceId::from_serial(0x77);

    let joins_before = net.joins_received(master);
    let rounds_before = net.device(master).scheduler().get_stats().rounds_completed;

    net.device(participant).app().schedule_device(phantom);
    net.run_steps(3);

    // One request, one forward.
    assert_eq!(net.joins_received(master), joins_before + 1);

    net.run_steps(60);
    assert_eq!(net.joins_received(master), joins_before + 1);
    assert!(
        net.device(master)
            .scheduler()
            .get_slot_table()
            .contains(&phantom),
        "forwarded device never made it into the schedule"
    );

    // The phantom slot just times out; rounds keep completing around it.
    let rounds_after = net.device(master).scheduler().get_stats().rounds_completed;
    assert!(rounds_after > rounds_before);
}

#[test]
fn test_find_my_tag_beeps_through_the_whole_stack() {
    let mut net = SimNetwork::new(SimConfig::default());
    let a = net.add_tag(0x01, Position::new(0.0, 0.0)).unwrap();
    net.add_tag(0x02, Position::new(1000.0, 0.0)).unwrap();
    net.run_steps(120);

    net.device(a).app().context().request_find_my(3);
    net.run_steps(2);
    assert_eq!(net.device(a).platform().beeps, 3);

    // A second request is a fresh duration, not a queue.
    net.device(a).app().context().request_find_my(2);
    net.run_steps(2);
    assert_eq!(net.device(a).platform().beeps, 5);
}

#[test]
fn test_battery_event_flushes_storage_but_keeps_ranging() {
    let mut net = SimNetwork::new(SimConfig::default());
    let a = net.add_tag(0x01, Position::new(0.0, 0.0)).unwrap();
    net.add_tag(0x02, Position::new(1000.0, 0.0)).unwrap();
    net.run_steps(120);

    net.device(a).app().context().post_battery_event();
    net.run_steps(2);

    assert_eq!(net.device(a).platform().flushes, 1);
    assert!(net.device(a).scheduler().is_active());
}

#[test]
fn test_noisy_timestamps_stay_within_tolerance() {
    let config = SimConfig {
        noise_ticks: 20,
        ..SimConfig::default()
    };
    let mut net = SimNetwork::new(config);
    let a = net.add_tag(0x01, Position::new(0.0, 0.0)).unwrap();
    let b = net.add_tag(0x02, Position::new(10_000.0, 0.0)).unwrap();
    net.run_steps(300);

    let measured = measured_between(&net, a, b).expect("no measurement recorded");
    // Twenty ticks of jitter on each arrival stamp is about a decimetre.
    assert!(
        (measured - 10_000).abs() <= 500,
        "expected about 10000 mm, measured {measured} mm"
    );
}
