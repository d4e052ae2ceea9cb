use std::io::Write;
use std::thread;
use std::time::Duration;

use lib_forward::core::{BrokerSettings, Delimiter};
use project_tests::Harness;

#[test]
fn test_back_to_back_objects_reach_every_client() {
    let harness = Harness::start_default().unwrap();
    let mut first = harness.client().unwrap();
    let mut second = harness.client().unwrap();
    let mut sender = harness.sender().unwrap();

    sender.write_all(br#"{"a":1}{"b":2}"#).unwrap();

    for client in [&mut first, &mut second] {
        assert_eq!(client.read_line().unwrap(), "{\"a\":1}\n");
        assert_eq!(client.read_line().unwrap(), "{\"b\":2}\n");
    }
    harness.stop().unwrap();
}

#[test]
fn test_brace_inside_string_yields_one_message() {
    let harness = Harness::start_default().unwrap();
    let mut client = harness.client().unwrap();
    let mut sender = harness.sender().unwrap();

    sender.write_all(br#"{"x": "a}b"}"#).unwrap();
    sender.write_all(br#"{"done":true}"#).unwrap();

    assert_eq!(client.read_line().unwrap(), "{\"x\": \"a}b\"}\n");
    assert_eq!(client.read_line().unwrap(), "{\"done\":true}\n");
    assert_eq!(harness.stats().messages, 2);
}

#[test]
fn test_message_split_across_writes_is_reassembled() {
    let harness = Harness::start_default().unwrap();
    let mut client = harness.client().unwrap();
    let mut sender = harness.sender().unwrap();

    let doc = serde_json::json!({ "quote": "say \"}\" twice", "nested": { "k": [1, 2, 3] } }).to_string();
    for chunk in doc.as_bytes().chunks(3) {
        sender.write_all(chunk).unwrap();
        sender.flush().unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(client.read_line().unwrap(), format!("{doc}\n"));
}

#[test]
fn test_messages_from_several_senders_arrive_whole() {
    let harness = Harness::start_default().unwrap();
    let mut client = harness.client().unwrap();
    let mut left = harness.sender().unwrap();
    let mut right = harness.sender().unwrap();

    left.write_all(br#"{"from":"left","#).unwrap();
    right.write_all(br#"{"from":"right"}"#).unwrap();
    harness.wait_for(|s| s.messages == 1).unwrap();
    left.write_all(br#""n":1}"#).unwrap();

    assert_eq!(client.read_line().unwrap(), "{\"from\":\"right\"}\n");
    assert_eq!(client.read_line().unwrap(), "{\"from\":\"left\",\"n\":1}\n");
}

#[test]
fn test_partial_message_of_departed_sender_is_dropped() {
    let harness = Harness::start_default().unwrap();
    let mut client = harness.client().unwrap();

    let mut quitter = harness.sender().unwrap();
    quitter.write_all(br#"{"complete":1}{"partial":"#).unwrap();
    harness.wait_for(|s| s.messages == 1).unwrap();
    drop(quitter);
    harness.wait_for(|s| s.senders == 0).unwrap();

    let mut sender = harness.sender().unwrap();
    sender.write_all(br#"{"next":2}"#).unwrap();

    assert_eq!(client.read_line().unwrap(), "{\"complete\":1}\n");
    assert_eq!(client.read_line().unwrap(), "{\"next\":2}\n");
}

#[test]
fn test_client_input_is_ignored() {
    let harness = Harness::start_default().unwrap();
    let mut client = harness.client().unwrap();
    let mut sender = harness.sender().unwrap();

    client.write_all(br#"{"client":"talks"}"#).unwrap();
    sender.write_all(br#"{"ok":true}"#).unwrap();

    assert_eq!(client.read_line().unwrap(), "{\"ok\":true}\n");
    assert_eq!(harness.stats().messages, 1);
}

#[test]
fn test_raw_delimiter_concatenates_objects() {
    let settings = BrokerSettings { delimiter: Delimiter::None, ..BrokerSettings::default() };
    let harness = Harness::start(settings).unwrap();
    let mut client = harness.client().unwrap();
    let mut sender = harness.sender().unwrap();

    sender.write_all(b" {\"a\":1}\n{\"b\":2}").unwrap();

    let expected = br#"{"a":1}{"b":2}"#;
    assert_eq!(client.read_exact(expected.len()).unwrap(), expected.to_vec());
}
