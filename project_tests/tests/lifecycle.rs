use std::io::Write;

use lib_forward::core::{Broker, BrokerError, BrokerSettings, Role};
use project_tests::Harness;

#[test]
fn test_departed_peers_are_reaped() {
    let harness = Harness::start_default().unwrap();
    let client = harness.client().unwrap();
    let sender = harness.sender().unwrap();
    harness.wait_for(|s| s.clients == 1 && s.senders == 1).unwrap();

    drop(client);
    drop(sender);

    let stats = harness.wait_for(|s| s.clients == 0 && s.senders == 0).unwrap();
    assert_eq!(stats.accepted, 2);
}

#[test]
fn test_remaining_clients_still_served_after_reap() {
    let harness = Harness::start_default().unwrap();
    let gone = harness.client().unwrap();
    let mut stays = harness.client().unwrap();
    let mut sender = harness.sender().unwrap();

    drop(gone);
    harness.wait_for(|s| s.clients == 1).unwrap();

    sender.write_all(br#"{"after":"reap"}"#).unwrap();
    assert_eq!(stays.read_line().unwrap(), "{\"after\":\"reap\"}\n");
}

#[test]
fn test_sender_exceeding_message_limit_is_dropped() {
    let settings = BrokerSettings {
        sender_buffer_increment: 16,
        max_message_size: 64,
        ..BrokerSettings::default()
    };
    let harness = Harness::start(settings).unwrap();
    let mut client = harness.client().unwrap();
    let mut greedy = harness.sender().unwrap();

    let huge = format!("{{\"pad\":\"{}\"}}", "y".repeat(256));
    // The broker may close the socket before everything is written.
    let _ = greedy.write_all(huge.as_bytes());
    harness.wait_for(|s| s.senders == 0).unwrap();

    let mut polite = harness.sender().unwrap();
    polite.write_all(br#"{"small":1}"#).unwrap();
    assert_eq!(client.read_line().unwrap(), "{\"small\":1}\n");
}

#[test]
fn test_stop_closes_client_connections() {
    let harness = Harness::start_default().unwrap();
    let mut client = harness.client().unwrap();
    harness.stop().unwrap();
    assert!(client.is_closed_by_peer().unwrap());
}

#[test]
fn test_busy_port_is_a_startup_error() {
    let first = Broker::bind(BrokerSettings::loopback()).unwrap();
    let settings = BrokerSettings {
        sender_addr: first.handle().client_addr(),
        ..BrokerSettings::loopback()
    };
    match Broker::bind(settings) {
        Err(BrokerError::Bind { role, .. }) => assert_eq!(role, Role::Sender),
        other => panic!("expected a bind error, got {other:?}"),
    }
}
