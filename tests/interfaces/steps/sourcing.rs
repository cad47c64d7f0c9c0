//! Cross-account sourcing step definitions.

use std::fmt;
use std::time::Duration;

use cucumber::{given, then, when, World};
use stream_sourcing::config::{AccountConfig, Config, SourceConfig, StorageType, StreamConfig};
use stream_sourcing::message::Message;
use stream_sourcing::registry::MessageQuery;
use stream_sourcing::storage::Storage;
use stream_sourcing::subject::Subject;
use stream_sourcing::{Broker, Connection, ErrorKind};

use crate::common::{await_condition, messages, PASSWORD};

/// Test context for sourcing scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct SourcingWorld {
    broker: Option<Broker>,
    last_error: Option<ErrorKind>,
}

impl fmt::Debug for SourcingWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourcingWorld")
            .field("started", &self.broker.is_some())
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl SourcingWorld {
    fn new() -> Self {
        Self {
            broker: None,
            last_error: None,
        }
    }

    fn broker(&self) -> &Broker {
        self.broker.as_ref().expect("Broker not started")
    }

    fn connect(&self, account: &str) -> Connection {
        self.broker()
            .connect(&format!("user-{account}"), PASSWORD)
            .expect("Failed to connect")
    }

    fn record<T>(&mut self, result: stream_sourcing::Result<T>) {
        self.last_error = result.err().map(|e| e.kind());
    }
}

fn memory_stream(name: &str) -> StreamConfig {
    StreamConfig::named(name).with_storage(StorageType::Memory)
}

fn parse_kind(kind: &str) -> ErrorKind {
    match kind {
        "Configuration" => ErrorKind::Configuration,
        "PermissionDenied" => ErrorKind::PermissionDenied,
        "NotFound" => ErrorKind::NotFound,
        "TransientUpstreamUnavailable" => ErrorKind::TransientUpstreamUnavailable,
        "LimitExceeded" => ErrorKind::LimitExceeded,
        "InvalidRequest" => ErrorKind::InvalidRequest,
        "Storage" => ErrorKind::Storage,
        other => panic!("Unknown error kind: {other}"),
    }
}

// --- Background ---

#[given(expr = "a broker with accounts {string} and {string}")]
async fn given_broker(world: &mut SourcingWorld, first: String, second: String) {
    let config = [first, second].into_iter().fold(Config::for_test(), |config, name| {
        let user = format!("user-{name}");
        config.with_account(AccountConfig::new(name).with_user(user, PASSWORD))
    });
    let broker = Broker::builder(config)
        .with_storage(Storage::memory())
        .start()
        .await
        .expect("Failed to start broker");
    world.broker = Some(broker);
}

// --- Given steps ---

#[given(expr = "account {string} has stream {string} on subjects {string}")]
async fn given_stream(world: &mut SourcingWorld, account: String, stream: String, subjects: String) {
    world
        .connect(&account)
        .add_stream(memory_stream(&stream).with_subjects(subjects.split(',').map(str::trim)))
        .await
        .expect("Failed to create stream");
}

#[given(expr = "account {string} exports stream {string} to account {string}")]
async fn given_export(world: &mut SourcingWorld, account: String, stream: String, importer: String) {
    world
        .connect(&account)
        .export_stream(&stream, None, &[importer.as_str()])
        .await
        .expect("Failed to export stream");
}

#[given(expr = "account {string} has stream {string} sourcing {string} from {string} with filter {string}")]
async fn given_sourcing_stream(
    world: &mut SourcingWorld,
    account: String,
    stream: String,
    upstream: String,
    api: String,
    filter: String,
) {
    let source = SourceConfig::external(upstream, api)
        .with_filter(filter)
        .with_deliver(stream.clone());
    world
        .connect(&account)
        .add_stream(memory_stream(&stream).with_source(source))
        .await
        .expect("Failed to create sourcing stream");
}

// --- When steps ---

#[when(expr = "account {string} publishes {string}")]
async fn when_publish(world: &mut SourcingWorld, account: String, subject: String) {
    world
        .connect(&account)
        .publish(&subject, subject.clone())
        .await
        .expect("Failed to publish");
}

#[when(expr = "account {string} adds a source on {string} reading {string} from {string}")]
async fn when_add_source(
    world: &mut SourcingWorld,
    account: String,
    stream: String,
    upstream: String,
    api: String,
) {
    let result = world
        .connect(&account)
        .add_source(&stream, &SourceConfig::external(upstream, api))
        .await;
    world.record(result);
}

#[when(expr = "account {string} publishes {string} through the handle for {string} at {string}")]
async fn when_publish_through_handle(
    world: &mut SourcingWorld,
    account: String,
    subject: String,
    stream: String,
    api: String,
) {
    let handle = world
        .connect(&account)
        .resolve_external(&api, &stream)
        .await
        .expect("Failed to resolve exported stream");
    let message = Message::new(Subject::new(subject).expect("valid subject"), "x");
    let result = handle.publish(message).await.map_err(stream_sourcing::Error::from);
    world.record(result);
}

#[when(expr = "account {string} creates stream {string} sourcing {string} from {string}")]
async fn when_create_sourcing_stream(
    world: &mut SourcingWorld,
    account: String,
    stream: String,
    upstream: String,
    api: String,
) {
    let result = world
        .connect(&account)
        .add_stream(memory_stream(&stream).with_source(SourceConfig::external(upstream, api)))
        .await;
    world.record(result);
}

// --- Then steps ---

#[then(expr = "stream {string} of account {string} holds {int} message(s) within {int} seconds")]
async fn then_holds_messages(
    world: &mut SourcingWorld,
    stream: String,
    account: String,
    expected: u64,
    seconds: u64,
) {
    let conn = world.connect(&account);
    let met = await_condition(
        || {
            let conn = conn.clone();
            let stream = stream.clone();
            async move { messages(&conn, &stream).await == expected }
        },
        Duration::from_secs(seconds),
        Duration::from_millis(100),
    )
    .await;
    assert!(
        met,
        "{account}.{stream} holds {} messages, expected {expected}",
        messages(&conn, &stream).await
    );
}

#[then(expr = "the last message in stream {string} of account {string} has subject {string}")]
async fn then_last_subject(world: &mut SourcingWorld, stream: String, account: String, subject: String) {
    let conn = world.connect(&account);
    let last_seq = conn
        .stream_info(&stream)
        .await
        .expect("Failed to read stream info")
        .state
        .last_seq;
    let message = conn
        .get_message(&stream, &MessageQuery::Sequence(last_seq))
        .await
        .expect("Failed to read last message");
    assert_eq!(message.subject, subject);
}

#[then(expr = "the request fails with {string}")]
async fn then_fails_with(world: &mut SourcingWorld, kind: String) {
    assert_eq!(world.last_error, Some(parse_kind(&kind)));
}

#[then(expr = "the broker holds {int} binding(s)")]
async fn then_binding_count(world: &mut SourcingWorld, expected: usize) {
    assert_eq!(world.broker().bindings().await.len(), expected);
}

#[then(expr = "account {string} has no streams")]
async fn then_no_streams(world: &mut SourcingWorld, account: String) {
    assert!(world.connect(&account).stream_names().await.is_empty());
}
