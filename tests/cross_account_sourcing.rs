//! Cross-account sourcing integration tests.
//!
//! Run with: cargo test --test cross_account_sourcing
//!
//! Drives a broker through authenticated connections exactly as a client
//! would: two accounts, an exported upstream and a sourcing downstream.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use stream_sourcing::binding::{BindingError, BindingId};
use stream_sourcing::bridge::ExternalApiAddress;
use stream_sourcing::config::{Config, RetentionPolicy, SourceConfig, StorageType, StreamConfig};
use stream_sourcing::message::{Message, SOURCE_HEADER, SOURCE_SEQUENCE_HEADER};
use stream_sourcing::registry::MessageQuery;
use stream_sourcing::sourcing::SourcingState;
use stream_sourcing::subject::Subject;
use stream_sourcing::{Broker, Connection, Error, ErrorKind};

fn source_all() -> SourceConfig {
    SourceConfig::external("testA", API_A).with_deliver("testB")
}

async fn only_binding(broker: &Broker) -> BindingId {
    let bindings = broker.bindings().await;
    assert_eq!(bindings.len(), 1, "expected exactly one binding");
    bindings[0].0
}

async fn sourced_sequences(conn: &Connection, stream: &str) -> Vec<u64> {
    let last = conn.stream_info(stream).await.unwrap().state.last_seq;
    let mut sequences = Vec::new();
    for seq in 1..=last {
        if let Ok(message) = conn.get_message(stream, &MessageQuery::Sequence(seq)).await {
            let upstream = message
                .headers
                .get(SOURCE_SEQUENCE_HEADER)
                .and_then(|v| v.parse().ok())
                .expect("sourced message carries its upstream sequence");
            sequences.push(upstream);
        }
    }
    sequences
}

#[tokio::test]
async fn test_unfiltered_source_copies_every_message() {
    let broker = start_broker().await;
    let (a, b) = connect_both(&broker);

    a.add_stream_json(TEST_A_JSON).await.unwrap();
    b.add_stream(
        StreamConfig::named("testB")
            .with_source(source_all())
            .with_storage(StorageType::Memory),
    )
    .await
    .unwrap();

    a.publish("foo.a", "hello").await.unwrap();
    assert!(await_messages(&b, "testB", 1).await);

    let message = b
        .get_message("testB", &MessageQuery::Sequence(1))
        .await
        .unwrap();
    assert_eq!(message.subject, "foo.a");
    assert_eq!(message.headers.get(SOURCE_HEADER), Some("testA.testA"));
    assert_eq!(message.headers.get(SOURCE_SEQUENCE_HEADER), Some("1"));
    broker.shutdown().await;
}

#[tokio::test]
async fn test_filtered_source_copies_matching_subjects_only() {
    let broker = start_broker().await;
    let (a, b) = connect_both(&broker);

    a.add_stream_json(TEST_A_JSON).await.unwrap();
    b.add_stream_json(TEST_B_JSON).await.unwrap();

    a.publish("foo.a", "a").await.unwrap();
    a.publish("foo.b", "b").await.unwrap();
    assert!(await_messages(&b, "testB", 1).await);

    let last = b
        .get_message("testB", &MessageQuery::LastBySubject("foo.b".to_string()))
        .await
        .unwrap();
    assert_eq!(last.subject, "foo.b");
    assert_eq!(last.sequence, 1);
    let err = b
        .get_message("testB", &MessageQuery::LastBySubject("foo.a".to_string()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    settle().await;
    assert_eq!(messages(&b, "testB").await, 1);

    let status = b.source_status(only_binding(&broker).await).await.unwrap();
    assert_eq!(status.cursor, 2);
    assert_eq!(status.applied, 1);
    assert_eq!(status.skipped, 1);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_cross_account_cycle_rejected() {
    let broker = start_broker().await;
    let (a, b) = connect_both(&broker);

    a.add_stream_json(TEST_A_JSON).await.unwrap();
    b.add_stream_json(TEST_B_JSON).await.unwrap();
    let address_b = b.export_stream("testB", None, &["testA"]).await.unwrap();
    assert_eq!(address_b.as_str(), "$JS.testB.API");

    let err = a
        .add_source(
            "testA",
            &SourceConfig::external("testB", address_b.as_str()),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::Binding(BindingError::CircularSourcing(_))),
        "{err:?}"
    );
    assert_eq!(err.kind(), ErrorKind::Configuration);

    // No partial state: testB gained no consumer.
    assert_eq!(broker.bindings().await.len(), 1);
    assert_eq!(a.stream_info("testA").await.unwrap().state.consumer_count, 1);
    assert_eq!(b.stream_info("testB").await.unwrap().state.consumer_count, 0);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_exported_handle_is_read_only() {
    let broker = start_broker().await;
    let (a, b) = connect_both(&broker);
    a.add_stream_json(TEST_A_JSON).await.unwrap();

    let handle = b.resolve_external(API_A, "testA").await.unwrap();
    let message = Message::new(Subject::new("foo.a").unwrap(), "intruder");
    let err = handle.publish(message).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(messages(&a, "testA").await, 0);

    // Publishing from testB's own account never reaches testA either.
    let err = b.publish("foo.a", "x").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_downstream_preserves_upstream_order() {
    let broker = start_broker().await;
    let (a, b) = connect_both(&broker);
    a.add_stream_json(TEST_A_JSON).await.unwrap();
    b.add_stream_json(TEST_B_JSON).await.unwrap();

    let publishers: Vec<_> = (0..4)
        .map(|task| {
            let a = a.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    let subject = if (task + i) % 2 == 0 { "foo.b" } else { "foo.a" };
                    a.publish(subject, format!("{task}-{i}")).await.unwrap();
                }
            })
        })
        .collect();
    for publisher in publishers {
        publisher.await.unwrap();
    }
    assert_eq!(a.stream_info("testA").await.unwrap().state.last_seq, 100);

    assert!(await_messages(&b, "testB", 50).await);
    let sequences = sourced_sequences(&b, "testB").await;
    assert!(sequences.windows(2).all(|w| w[0] < w[1]), "{sequences:?}");
    broker.shutdown().await;
}

#[tokio::test]
async fn test_source_added_after_publishes_converges() {
    let broker = start_broker().await;
    let (a, b) = connect_both(&broker);
    a.add_stream_json(TEST_A_JSON).await.unwrap();
    for i in 0..10 {
        a.publish(if i % 2 == 0 { "foo.a" } else { "foo.b" }, "x")
            .await
            .unwrap();
    }

    b.add_stream_json(TEST_B_JSON).await.unwrap();
    assert!(await_messages(&b, "testB", 5).await);

    a.publish("foo.b", "live").await.unwrap();
    assert!(await_messages(&b, "testB", 6).await);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_recovers_from_lost_connectivity() {
    let broker = start_broker().await;
    let (a, b) = connect_both(&broker);
    a.add_stream_json(TEST_A_JSON).await.unwrap();
    b.add_stream_json(TEST_B_JSON).await.unwrap();
    let id = only_binding(&broker).await;
    let address = ExternalApiAddress::parse(API_A).unwrap();

    a.publish("foo.b", "1").await.unwrap();
    assert!(await_messages(&b, "testB", 1).await);

    broker.disconnect(&address).await;
    a.publish("foo.b", "2").await.unwrap();
    a.publish("foo.b", "3").await.unwrap();
    assert!(
        await_condition(
            || {
                let b = b.clone();
                async move {
                    b.source_status(id).await.unwrap().state == SourcingState::Recovering
                }
            },
            Duration::from_secs(2),
            Duration::from_millis(20),
        )
        .await
    );
    assert_eq!(messages(&b, "testB").await, 1);

    broker.reconnect(&address).await;
    assert!(await_messages(&b, "testB", 3).await);
    assert_eq!(sourced_sequences(&b, "testB").await, vec![1, 2, 3]);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_evicted_upstream_messages_reported() {
    let broker = start_broker().await;
    let (a, b) = connect_both(&broker);
    let mut upstream = StreamConfig::from_json(TEST_A_JSON).unwrap();
    upstream.max_msgs = 2;
    a.add_stream(upstream).await.unwrap();
    for _ in 0..5 {
        a.publish("foo.b", "x").await.unwrap();
    }

    b.add_stream_json(TEST_B_JSON).await.unwrap();
    assert!(await_messages(&b, "testB", 2).await);

    let status = b.source_status(only_binding(&broker).await).await.unwrap();
    assert_eq!(status.missed, 3);
    assert_eq!(status.cursor, 5);
    let error = status.last_error.expect("missing messages are reported");
    assert_eq!(error.kind, ErrorKind::NotFound);
    assert_eq!(sourced_sequences(&b, "testB").await, vec![4, 5]);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_interest_upstream_drops_messages_once_sourced() {
    let broker = start_broker().await;
    let (a, b) = connect_both(&broker);
    let mut upstream = StreamConfig::from_json(TEST_A_JSON).unwrap();
    upstream.retention = RetentionPolicy::Interest;
    a.add_stream(upstream).await.unwrap();
    b.add_stream_json(TEST_B_JSON).await.unwrap();

    a.publish("foo.a", "x").await.unwrap();
    a.publish("foo.b", "x").await.unwrap();
    assert!(await_messages(&b, "testB", 1).await);
    assert!(await_messages(&a, "testA", 0).await);
    assert_eq!(a.stream_info("testA").await.unwrap().state.last_seq, 2);
    broker.shutdown().await;
}

#[cfg(feature = "sqlite")]
mod durable {
    use super::*;
    use stream_sourcing::storage::{init_storage, MemoryCursorStore};

    fn config(dir: &tempfile::TempDir) -> Config {
        two_accounts().with_store_dir(dir.path().to_string_lossy().to_string())
    }

    #[tokio::test]
    async fn test_restart_resumes_without_reapplying() {
        let dir = tempfile::tempdir().unwrap();

        let broker = Broker::start(config(&dir)).await.unwrap();
        let (a, b) = connect_both(&broker);
        a.add_stream(file_backed(TEST_A_JSON)).await.unwrap();
        b.add_stream(file_backed(TEST_B_JSON)).await.unwrap();
        a.publish("foo.a", "x").await.unwrap();
        a.publish("foo.b", "x").await.unwrap();
        assert!(await_messages(&b, "testB", 1).await);
        let id = only_binding(&broker).await;
        assert!(
            await_condition(
                || {
                    let b = b.clone();
                    async move { b.source_status(id).await.unwrap().cursor == 2 }
                },
                Duration::from_secs(2),
                Duration::from_millis(20),
            )
            .await
        );
        broker.shutdown().await;

        let broker = Broker::start(config(&dir)).await.unwrap();
        let (a, b) = connect_both(&broker);
        assert_eq!(a.stream_names().await, vec!["testA"]);
        assert_eq!(only_binding(&broker).await, id);
        settle().await;
        assert_eq!(messages(&b, "testB").await, 1);

        a.publish("foo.b", "after restart").await.unwrap();
        assert!(await_messages(&b, "testB", 2).await);
        assert_eq!(sourced_sequences(&b, "testB").await, vec![2, 3]);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_lost_cursor_write_reapplies_once() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = Arc::new(MemoryCursorStore::new());
        let storage = || {
            let cursors = cursors.clone();
            let config = config(&dir);
            async move {
                init_storage(&config.server)
                    .await
                    .unwrap()
                    .with_cursor_store(cursors)
            }
        };

        let broker = Broker::builder(config(&dir))
            .with_storage(storage().await)
            .start()
            .await
            .unwrap();
        let (a, b) = connect_both(&broker);
        a.add_stream(file_backed(TEST_A_JSON)).await.unwrap();
        b.add_stream(file_backed(TEST_B_JSON)).await.unwrap();
        let id = only_binding(&broker).await;

        a.publish("foo.b", "first").await.unwrap();
        assert!(await_messages(&b, "testB", 1).await);
        cursors.set_fail_on_put(true).await;
        a.publish("foo.b", "second").await.unwrap();
        assert!(await_messages(&b, "testB", 2).await);
        assert!(
            await_condition(
                || {
                    let b = b.clone();
                    async move {
                        b.source_status(id)
                            .await
                            .unwrap()
                            .last_error
                            .is_some_and(|e| e.kind == ErrorKind::Storage)
                    }
                },
                Duration::from_secs(2),
                Duration::from_millis(20),
            )
            .await
        );
        broker.shutdown().await;

        cursors.set_fail_on_put(false).await;
        let broker = Broker::builder(config(&dir))
            .with_storage(storage().await)
            .start()
            .await
            .unwrap();
        let (_a, b) = connect_both(&broker);

        // The unpersisted message is applied again; its source headers
        // identify the repeat.
        assert!(await_messages(&b, "testB", 3).await);
        let sequences = sourced_sequences(&b, "testB").await;
        assert_eq!(sequences, vec![1, 2, 2]);
        let distinct: HashSet<_> = sequences.iter().collect();
        assert_eq!(distinct.len(), 2);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_binding_lost_on_restart_sources_recreated_upstream_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = Arc::new(MemoryCursorStore::new());
        let storage = || {
            let cursors = cursors.clone();
            let config = config(&dir);
            async move {
                init_storage(&config.server)
                    .await
                    .unwrap()
                    .with_cursor_store(cursors)
            }
        };
        let memory_upstream = || StreamConfig::from_json(TEST_A_JSON).unwrap();

        let broker = Broker::builder(config(&dir))
            .with_storage(storage().await)
            .start()
            .await
            .unwrap();
        let (a, b) = connect_both(&broker);
        a.add_stream(memory_upstream()).await.unwrap();
        b.add_stream(file_backed(TEST_B_JSON)).await.unwrap();
        for _ in 0..3 {
            a.publish("foo.b", "before").await.unwrap();
        }
        assert!(await_messages(&b, "testB", 3).await);
        let id = only_binding(&broker).await;
        assert!(
            await_condition(
                || {
                    let b = b.clone();
                    async move { b.source_status(id).await.unwrap().cursor == 3 }
                },
                Duration::from_secs(2),
                Duration::from_millis(20),
            )
            .await
        );
        broker.shutdown().await;

        // The memory upstream is gone, so the binding cannot come back.
        let broker = Broker::builder(config(&dir))
            .with_storage(storage().await)
            .start()
            .await
            .unwrap();
        let (a, b) = connect_both(&broker);
        assert!(broker.bindings().await.is_empty());
        assert_eq!(cursors.stored_count().await, 0);

        a.add_stream(memory_upstream()).await.unwrap();
        let source = SourceConfig::external("testA", API_A)
            .with_filter("foo.b")
            .with_deliver("testB");
        assert_eq!(b.add_source("testB", &source).await.unwrap(), id);
        a.publish("foo.b", "after").await.unwrap();
        a.publish("foo.b", "after").await.unwrap();

        assert!(await_messages(&b, "testB", 5).await);
        assert_eq!(sourced_sequences(&b, "testB").await, vec![1, 2, 3, 1, 2]);
        broker.shutdown().await;
    }
}
