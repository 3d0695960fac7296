//! Integration tests against a real Redis instance via testcontainers.
//!
//! Covers the round-trip/idempotence property from spec.md §8:
//! `enqueue; pop_and_move; remove_one` returns queue state to its
//! pre-enqueue shape.

use std::time::Duration;
use taskflow_broker::{Broker, RedisBroker};
use testcontainers::{clients::Cli, images::redis::Redis};

async fn test_broker(docker: &Cli) -> (RedisBroker, testcontainers::Container<'_, Redis>) {
    let container = docker.run(Redis::default());
    let port = container.get_host_port_ipv4(6379);
    let broker = RedisBroker::new("127.0.0.1", port).expect("connect to test redis");
    (broker, container)
}

#[tokio::test]
async fn enqueue_pop_and_remove_round_trips() {
    let docker = Cli::default();
    let (broker, _container) = test_broker(&docker).await;

    broker.enqueue("queue:default", "msg-1").await.unwrap();

    let popped = broker
        .blocking_pop_and_move("queue:default", "processing:default", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(popped.as_deref(), Some("msg-1"));

    let processing = broker.range("processing:default", 0, -1).await.unwrap();
    assert_eq!(processing, vec!["msg-1".to_string()]);

    broker
        .remove_one("processing:default", "msg-1")
        .await
        .unwrap();

    let processing_after = broker.range("processing:default", 0, -1).await.unwrap();
    assert!(processing_after.is_empty());

    let queue_after = broker.range("queue:default", 0, -1).await.unwrap();
    assert!(queue_after.is_empty());
}

#[tokio::test]
async fn enqueue_many_pipelines_all_messages_in_order() {
    let docker = Cli::default();
    let (broker, _container) = test_broker(&docker).await;

    let messages = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    broker.enqueue_many("queue:default", &messages).await.unwrap();

    let queued = broker.range("queue:default", 0, -1).await.unwrap();
    assert_eq!(queued.len(), 3);
    for m in &messages {
        assert!(queued.contains(m));
    }
}

#[tokio::test]
async fn enqueue_many_is_a_no_op_on_empty_slice() {
    let docker = Cli::default();
    let (broker, _container) = test_broker(&docker).await;

    broker.enqueue_many("queue:default", &[]).await.unwrap();
    let queued = broker.range("queue:default", 0, -1).await.unwrap();
    assert!(queued.is_empty());
}

#[tokio::test]
async fn lease_acquire_and_renew_and_release() {
    let docker = Cli::default();
    let (broker, _container) = test_broker(&docker).await;

    let acquired = broker
        .set_if_absent_with_expiry("taskflow:leader", "instance-a", 10_000)
        .await
        .unwrap();
    assert!(acquired);

    let blocked = broker
        .set_if_absent_with_expiry("taskflow:leader", "instance-b", 10_000)
        .await
        .unwrap();
    assert!(!blocked);

    let renewed = broker
        .compare_and_extend("taskflow:leader", "instance-a", 10_000)
        .await
        .unwrap();
    assert!(renewed);

    let renewed_by_wrong_owner = broker
        .compare_and_extend("taskflow:leader", "instance-b", 10_000)
        .await
        .unwrap();
    assert!(!renewed_by_wrong_owner);

    let deleted = broker
        .compare_and_delete("taskflow:leader", "instance-a")
        .await
        .unwrap();
    assert!(deleted);
    assert!(!broker.exists("taskflow:leader").await.unwrap());
}
