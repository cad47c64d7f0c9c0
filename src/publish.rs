//! Publish path: route a message to the single stream of the publishing
//! account whose filters admit its subject.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::account::AccountId;
use crate::message::Message;
use crate::registry::{Result, Stream, StreamError, StreamRegistry};
use crate::subject::Subject;

/// Subjects under this prefix belong to the stream API and cannot be published to.
pub const API_PREFIX: &str = "$JS.";

/// Acknowledgement returned once a message is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PubAck {
    pub stream: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
    /// True when a `Msg-Id` repeat was recognised and nothing was appended.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
}

impl StreamRegistry {
    /// Find the stream of `account` whose filters admit `subject`.
    ///
    /// Only the account's own streams are considered.
    pub async fn route(&self, account: &AccountId, subject: &Subject) -> Result<Arc<Stream>> {
        self.streams_of(account)
            .await
            .into_iter()
            .find(|stream| stream.admits(subject.as_str()))
            .ok_or_else(|| StreamError::NoMatchingStream {
                account: account.to_string(),
                subject: subject.to_string(),
            })
    }

    /// Publish a message into the account's matching stream.
    pub async fn publish(&self, account: &AccountId, message: Message) -> Result<PubAck> {
        if message.subject.as_str().starts_with(API_PREFIX) {
            return Err(StreamError::ReservedSubject(message.subject.to_string()));
        }

        let stream = self.route(account, &message.subject).await?;
        let subject = message.subject.clone();
        let ack = stream.append(message).await?;

        debug!(
            account = %account,
            subject = %subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Published"
        );
        Ok(ack)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::account::AccountTable;
    use crate::config::{AccountConfig, StorageType, StreamConfig};
    use crate::error::ErrorKind;
    use crate::message::{Headers, MSG_ID_HEADER};
    use crate::storage::Storage;

    fn registry() -> StreamRegistry {
        let accounts = AccountTable::from_config(&[
            AccountConfig::new("testA"),
            AccountConfig::new("testB"),
        ]);
        StreamRegistry::new(Arc::new(accounts), Storage::memory(), 64)
    }

    fn msg(subject: &str) -> Message {
        Message::new(Subject::new(subject).unwrap(), Bytes::from_static(b"hi"))
    }

    async fn memory_stream(registry: &StreamRegistry, account: &str, name: &str, subjects: &[&str]) {
        registry
            .create_stream(
                &AccountId::from(account),
                StreamConfig::named(name)
                    .with_subjects(subjects.iter().copied())
                    .with_storage(StorageType::Memory),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publish_routes_to_matching_stream() {
        let registry = registry();
        memory_stream(&registry, "testA", "orders", &["orders.*"]).await;
        memory_stream(&registry, "testA", "payments", &["payments.>"]).await;

        let ack = registry
            .publish(&AccountId::from("testA"), msg("payments.card.ok"))
            .await
            .unwrap();
        assert_eq!(ack.stream, "payments");
        assert_eq!(ack.sequence, 1);
        assert!(!ack.duplicate);
    }

    #[tokio::test]
    async fn test_publish_only_sees_own_account() {
        let registry = registry();
        memory_stream(&registry, "testA", "testA", &["foo.*"]).await;

        let err = registry
            .publish(&AccountId::from("testB"), msg("foo.a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::NoMatchingStream { .. }));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_publish_to_api_subject_is_denied() {
        let registry = registry();
        let err = registry
            .publish(&AccountId::from("testA"), msg("$JS.testA.API.STREAM.CREATE"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_msg_id_is_deduplicated() {
        let registry = registry();
        memory_stream(&registry, "testA", "orders", &["orders.>"]).await;
        let account = AccountId::from("testA");

        let headers: Headers = [(MSG_ID_HEADER, "order-1")].into_iter().collect();
        let first = registry
            .publish(&account, msg("orders.new").with_headers(headers.clone()))
            .await
            .unwrap();
        let again = registry
            .publish(&account, msg("orders.new").with_headers(headers))
            .await
            .unwrap();

        assert_eq!(again.sequence, first.sequence);
        assert!(again.duplicate);
        let info = registry.info(&account, "orders").await.unwrap();
        assert_eq!(info.state.messages, 1);
    }

    #[tokio::test]
    async fn test_concurrent_publishers_get_unique_sequences() {
        let registry = Arc::new(registry());
        memory_stream(&registry, "testA", "orders", &["orders.>"]).await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut seqs = Vec::new();
                for j in 0..25 {
                    let subject = format!("orders.{i}.{j}");
                    let ack = registry
                        .publish(&AccountId::from("testA"), msg(&subject))
                        .await
                        .unwrap();
                    seqs.push(ack.sequence);
                }
                seqs
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            let seqs = task.await.unwrap();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            all.extend(seqs);
        }
        all.sort_unstable();
        assert_eq!(all, (1..=200).collect::<Vec<u64>>());
    }
}
