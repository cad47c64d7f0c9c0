//! Shared utilities for integration tests.
//!
//! Provides the two-account fixture, the stream definitions used by the
//! scenarios and a polling assertion helper.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use stream_sourcing::config::{AccountConfig, Config, ExportConfig, StorageType, StreamConfig};
use stream_sourcing::storage::Storage;
use stream_sourcing::{Broker, Connection};

pub const PASSWORD: &str = "s3cr3t";
pub const USER_A: &str = "user-testA";
pub const USER_B: &str = "user-testB";
pub const API_A: &str = "$JS.testA.API";

/// Upstream stream of the two-account scenario.
pub const TEST_A_JSON: &str = r#"
{
  "name": "testA",
  "subjects": ["foo.*"],
  "retention": "limits",
  "max_consumers": -1,
  "max_msgs_per_subject": -1,
  "max_msgs": -1,
  "max_bytes": -1,
  "max_age": 0,
  "max_msg_size": -1,
  "storage": "memory",
  "discard": "old",
  "num_replicas": 1,
  "duplicate_window": 120000000000,
  "sealed": false,
  "deny_delete": false,
  "deny_purge": false,
  "allow_rollup_hdrs": false,
  "allow_direct": false,
  "mirror_direct": false
}
"#;

/// Downstream stream sourcing `foo.b` from testA through its external API.
pub const TEST_B_JSON: &str = r#"
{
  "name": "testB",
  "sources": [
    {
      "name": "testA",
      "filter_subject": "foo.b",
      "external": { "api": "$JS.testA.API", "deliver": "testB" }
    }
  ],
  "retention": "limits",
  "max_consumers": -1,
  "max_msgs_per_subject": -1,
  "max_msgs": -1,
  "max_bytes": -1,
  "max_age": 0,
  "max_msg_size": -1,
  "storage": "memory",
  "discard": "old",
  "num_replicas": 1,
  "duplicate_window": 120000000000,
  "sealed": false,
  "deny_delete": false,
  "deny_purge": false,
  "allow_rollup_hdrs": false,
  "allow_direct": false,
  "mirror_direct": false
}
"#;

/// Two accounts; testA exports stream testA to testB.
pub fn two_accounts() -> Config {
    Config::for_test()
        .with_account(
            AccountConfig::new("testA")
                .with_user(USER_A, PASSWORD)
                .with_export(ExportConfig::new("testA").to("testB")),
        )
        .with_account(AccountConfig::new("testB").with_user(USER_B, PASSWORD))
}

/// A memory-only broker with the two-account configuration.
pub async fn start_broker() -> Broker {
    Broker::builder(two_accounts())
        .with_storage(Storage::memory())
        .start()
        .await
        .expect("broker start")
}

pub fn connect_both(broker: &Broker) -> (Connection, Connection) {
    (
        broker.connect(USER_A, PASSWORD).expect("connect testA"),
        broker.connect(USER_B, PASSWORD).expect("connect testB"),
    )
}

/// Definition with the same shape as `json`, stored in files.
pub fn file_backed(json: &str) -> StreamConfig {
    let mut config = StreamConfig::from_json(json).expect("fixture parses");
    config.storage = StorageType::File;
    config
}

/// Message count of a stream.
pub async fn messages(conn: &Connection, stream: &str) -> u64 {
    conn.stream_info(stream)
        .await
        .expect("stream info")
        .state
        .messages
}

/// Poll `predicate` every `interval` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn await_condition<F, Fut>(mut predicate: F, timeout: Duration, interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait until `stream` holds exactly `expected` messages.
pub async fn await_messages(conn: &Connection, stream: &str, expected: u64) -> bool {
    await_condition(
        || async move { messages(conn, stream).await == expected },
        Duration::from_secs(2),
        Duration::from_millis(100),
    )
    .await
}

/// Give consumers time to act on something that should have no effect.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
