//! Publisher tests over the in-memory backend.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stream_queue::{Backoff, MemoryBackend, Message, Publisher, PublisherOptions, QueueError};
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Reading {
    sensor: String,
    value: f64,
}

fn fast_options() -> PublisherOptions {
    PublisherOptions::new().with_backoff(
        Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 2.0).with_jitter(false),
    )
}

#[tokio::test]
async fn test_publish_assigns_the_server_id() {
    let backend = MemoryBackend::new();
    let publisher = Publisher::new(backend.clone(), fast_options());

    let payload = Reading {
        sensor: "kitchen".to_string(),
        value: 21.5,
    };
    let mut message = Message::json("sensor.updated", &payload).unwrap();
    assert!(message.id.is_empty());

    publisher
        .publish(&CancellationToken::new(), &mut message)
        .await
        .unwrap();

    assert!(!message.id.is_empty());
    assert!(message.timestamp().is_some());
    assert_eq!(backend.stream_len("sensor.updated"), 1);
}

#[tokio::test]
async fn test_publish_preserves_an_explicit_id() {
    let backend = MemoryBackend::new();
    let publisher = Publisher::new(backend.clone(), fast_options());

    let mut message = Message::new("sensor.updated", HashMap::new());
    message.id = "42-0".to_string();

    publisher
        .publish(&CancellationToken::new(), &mut message)
        .await
        .unwrap();
    assert_eq!(message.id, "42-0");
}

#[tokio::test]
async fn test_publish_caps_stream_length() {
    let backend = MemoryBackend::new();
    let publisher = Publisher::new(
        backend.clone(),
        fast_options()
            .with_stream_max_length(3)
            .with_approximate_max_length(false),
    );

    for i in 0..5 {
        let mut message = Message::json("sensor.updated", &i).unwrap();
        publisher
            .publish(&CancellationToken::new(), &mut message)
            .await
            .unwrap();
    }

    assert_eq!(backend.stream_len("sensor.updated"), 3);
}

#[tokio::test]
async fn test_transient_failures_are_retried_and_reported() {
    let backend = MemoryBackend::new();
    let mut publisher = Publisher::new(backend.clone(), fast_options());
    let mut errors = publisher.errors().unwrap();

    backend.fail_next(redis::RedisError::from(io::Error::new(
        io::ErrorKind::TimedOut,
        "timed out",
    )));

    let mut message = Message::json("sensor.updated", &1).unwrap();
    publisher
        .publish(&CancellationToken::new(), &mut message)
        .await
        .unwrap();
    assert_eq!(backend.stream_len("sensor.updated"), 1);

    match errors.try_recv().unwrap() {
        QueueError::Network { retrying, backoff, .. } => {
            assert!(retrying);
            assert!(backoff.is_some());
        }
        other => panic!("expected a retry notification, got {other:?}"),
    }
}

#[tokio::test]
async fn test_zero_network_retries_fail_immediately() {
    let backend = MemoryBackend::new();
    let publisher = Publisher::new(backend.clone(), fast_options().with_network_retry(0));

    backend.fail_next(redis::RedisError::from(io::Error::new(
        io::ErrorKind::TimedOut,
        "timed out",
    )));

    let mut message = Message::json("sensor.updated", &1).unwrap();
    let result = publisher
        .publish(&CancellationToken::new(), &mut message)
        .await;

    match result {
        Err(QueueError::Network { retrying, .. }) => assert!(!retrying),
        other => panic!("expected an exhausted network error, got {other:?}"),
    }
    assert!(message.id.is_empty(), "id must stay unset on failure");
}
