//! Durability across broker restarts: buffered messages survive and are
//! delivered to the first subscriber of the new incarnation.

mod common;

use std::fs;

use common::{md5_user, StompClient, TestBroker};
use tempfile::tempdir;

#[test]
fn buffered_message_survives_restart() {
    let dir = tempdir().unwrap();
    let users = dir.path().join("users");
    fs::write(
        &users,
        format!(
            "{}{}",
            md5_user("alice", "secret", "salt", "all"),
            md5_user("carol", "pw", "s", "all")
        ),
    )
    .unwrap();

    {
        let broker = TestBroker::start(dir.path(), &users, 1024);
        let (mut producer, _) = StompClient::login(broker.addr, "alice", "secret");
        producer.send_frame(
            "SEND",
            &[("destination", "q1"), ("receipt", "1")],
            b"hello",
        );
        producer.expect("RECEIPT");
        broker.stop();
    }

    let broker = TestBroker::start(dir.path(), &users, 1024);
    let (mut consumer, _) = StompClient::login(broker.addr, "carol", "pw");
    consumer.send_frame(
        "SUBSCRIBE",
        &[("destination", "q1"), ("ack", "client"), ("receipt", "2")],
        b"",
    );
    consumer.expect("RECEIPT");

    let message = consumer.expect("MESSAGE");
    assert_eq!(message.body, b"hello");
    assert_eq!(message.headers.get("source").unwrap(), "alice");

    broker.stop();
}

#[test]
fn backlog_order_survives_restart() {
    let dir = tempdir().unwrap();
    let users = dir.path().join("users");
    fs::write(
        &users,
        format!(
            "{}{}",
            md5_user("alice", "secret", "salt", "all"),
            md5_user("carol", "pw", "s", "all")
        ),
    )
    .unwrap();

    {
        let broker = TestBroker::start(dir.path(), &users, 1024);
        let (mut producer, _) = StompClient::login(broker.addr, "alice", "secret");
        for i in 0..3 {
            producer.send_frame(
                "SEND",
                &[("destination", "q1"), ("receipt", "r")],
                format!("msg-{i}").as_bytes(),
            );
            producer.expect("RECEIPT");
        }
        broker.stop();
    }

    let broker = TestBroker::start(dir.path(), &users, 1024);
    let (mut consumer, _) = StompClient::login(broker.addr, "carol", "pw");
    consumer.send_frame(
        "SUBSCRIBE",
        &[("destination", "q1"), ("ack", "client")],
        b"",
    );
    for i in 0..3 {
        let message = consumer.expect("MESSAGE");
        assert_eq!(message.body, format!("msg-{i}").as_bytes());
        consumer.ack();
    }

    broker.stop();
}
