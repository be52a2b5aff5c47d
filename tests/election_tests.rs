use rangetag::app::TagContext;
use rangetag::election::elect;
use rangetag::events::AppEvent;
use rangetag::types::{DeviceId, DiscoveredPeer, RangingRole};

fn peer(serial: u64, role: RangingRole) -> DiscoveredPeer {
    DiscoveredPeer {
        id: DeviceId::from_serial(serial),
        role,
    }
}

#[test]
fn test_existing_master_wins_over_every_other_candidate() {
    let own = DeviceId::from_serial(0x05);
    let roster = [
        peer(0xf0, RangingRole::Participant),
        peer(0x03, RangingRole::Master),
        peer(0xff, RangingRole::Unknown),
    ];

    let outcome = elect(own, &roster);
    assert_eq!(outcome.role, Some(RangingRole::Participant));
    assert_eq!(outcome.joins.as_slice(), &[DeviceId::from_serial(0x03)]);
}

#[test]
fn test_every_participant_is_joined_once() {
    let own = DeviceId::from_serial(0x05);
    let roster = [
        peer(0x10, RangingRole::Participant),
        peer(0x20, RangingRole::Participant),
        peer(0x10, RangingRole::Participant),
        peer(0x30, RangingRole::Unknown),
    ];

    let outcome = elect(own, &roster);
    assert_eq!(outcome.role, Some(RangingRole::Participant));
    assert_eq!(
        outcome.joins.as_slice(),
        &[DeviceId::from_serial(0x10), DeviceId::from_serial(0x20)]
    );
}

#[test]
fn test_sleeping_devices_never_become_join_targets() {
    let own = DeviceId::from_serial(0x05);
    let roster = [
        peer(0xf0, RangingRole::Asleep),
        peer(0x08, RangingRole::Unknown),
    ];

    let outcome = elect(own, &roster);
    assert_eq!(outcome.role, Some(RangingRole::Participant));
    assert_eq!(outcome.joins.as_slice(), &[DeviceId::from_serial(0x08)]);
}

#[test]
fn test_highest_id_stays_in_discovery() {
    let own = DeviceId::from_serial(0xf0);
    let roster = [
        peer(0x08, RangingRole::Unknown),
        peer(0x09, RangingRole::Unknown),
    ];

    let outcome = elect(own, &roster);
    assert_eq!(outcome.role, None);
    assert!(outcome.joins.is_empty());
}

#[test]
fn test_discovery_window_feeds_the_election() {
    let ctx = TagContext::new(DeviceId::from_serial(0x05));
    ctx.on_peer_discovered(DeviceId::from_serial(0x09), RangingRole::Master);
    ctx.on_peer_discovered(DeviceId::from_serial(0x07), RangingRole::Unknown);
    ctx.on_discovery_window_closed();

    let bits = ctx.events().take();
    assert!(AppEvent::NetworkFound.is_set(bits));
    assert!(!AppEvent::VerifyConfiguration.is_set(bits));

    let snapshot = ctx.peer_snapshot();
    let outcome = elect(ctx.own_id(), &snapshot);
    assert_eq!(outcome.role, Some(RangingRole::Participant));
    assert_eq!(outcome.joins.as_slice(), &[DeviceId::from_serial(0x09)]);
}

#[test]
fn test_empty_window_asks_for_a_configuration_check() {
    let ctx = TagContext::new(DeviceId::from_serial(0x05));
    ctx.on_discovery_window_closed();

    let bits = ctx.events().take();
    assert!(AppEvent::VerifyConfiguration.is_set(bits));
    assert!(!AppEvent::NetworkFound.is_set(bits));
}

#[test]
fn test_next_window_replaces_the_previous_roster() {
    let ctx = TagContext::new(DeviceId::from_serial(0x05));
    ctx.on_peer_discovered(DeviceId::from_serial(0x11), RangingRole::Unknown);
    ctx.on_discovery_window_closed();
    ctx.events().take();

    // A stale sighting from the first window must not survive into the
    // second window's election.
    ctx.on_peer_discovered(DeviceId::from_serial(0x22), RangingRole::Unknown);
    ctx.on_discovery_window_closed();

    let snapshot = ctx.peer_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, DeviceId::from_serial(0x22));

    let outcome = elect(ctx.own_id(), &snapshot);
    assert_eq!(outcome.joins.as_slice(), &[DeviceId::from_serial(0x22)]);
}
