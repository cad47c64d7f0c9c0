//! MessageStore trait definition.

use async_trait::async_trait;

use super::Result;
use crate::message::StoredMessage;

/// Summary of what a store currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreState {
    /// Stored message count.
    pub messages: u64,
    /// Stored message bytes.
    pub bytes: u64,
    /// Lowest stored sequence; `last_seq + 1` when empty after removals, 0 when never written.
    pub first_seq: u64,
    /// Highest sequence ever appended. Never decreases, even after purge.
    pub last_seq: u64,
    /// Distinct subjects among stored messages.
    pub num_subjects: u64,
}

/// Interface for the messages of one stream.
///
/// Sequence assignment happens in the stream's writer; the store only
/// persists what it is given, in increasing sequence order.
///
/// # Implementations
///
/// - `MemoryMessageStore`: in-process, lost on shutdown
/// - `SqliteMessageStore`: committed to SQLite before `append` returns
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a message. `message.sequence` must exceed every stored sequence.
    async fn append(&self, message: &StoredMessage) -> Result<()>;

    /// Fetch one message by sequence.
    async fn get(&self, sequence: u64) -> Result<Option<StoredMessage>>;

    /// Fetch up to `limit` messages with sequence >= `from`, ascending.
    async fn range(&self, from: u64, limit: usize) -> Result<Vec<StoredMessage>>;

    /// Newest stored message on exactly `subject`.
    async fn last_for_subject(&self, subject: &str) -> Result<Option<StoredMessage>>;

    /// Stored sequences on exactly `subject`, ascending.
    async fn sequences_for_subject(&self, subject: &str) -> Result<Vec<u64>>;

    /// Remove one message, returning its size, or `None` if it was not stored.
    async fn remove(&self, sequence: u64) -> Result<Option<u64>>;

    /// Remove every message. Returns how many were removed.
    async fn purge(&self) -> Result<u64>;

    /// Current counts and bounds.
    async fn state(&self) -> Result<StoreState>;

    /// Drop all data including the sequence high-water mark.
    async fn destroy(&self) -> Result<()>;
}
