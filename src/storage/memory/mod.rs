//! In-memory storage implementations.
//!
//! Used for `memory` streams, brokers started without a store directory,
//! and as fault-injecting stand-ins in tests.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CursorStore, MessageStore, Result, StorageError, StoreState, StreamCatalog};
use crate::config::StreamConfig;
use crate::message::StoredMessage;

#[derive(Default)]
struct MessageState {
    messages: BTreeMap<u64, StoredMessage>,
    by_subject: HashMap<String, BTreeSet<u64>>,
    bytes: u64,
    last_seq: u64,
}

/// Message store backed by an ordered map.
#[derive(Default)]
pub struct MemoryMessageStore {
    state: RwLock<MessageState>,
    fail_on_append: RwLock<bool>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_append(&self, fail: bool) {
        *self.fail_on_append.write().await = fail;
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: &StoredMessage) -> Result<()> {
        if *self.fail_on_append.read().await {
            return Err(StorageError::Unavailable("append disabled".to_string()));
        }
        let mut state = self.state.write().await;
        if message.sequence <= state.last_seq {
            return Err(StorageError::Corrupt(format!(
                "sequence {} not after {}",
                message.sequence, state.last_seq
            )));
        }
        state.last_seq = message.sequence;
        state.bytes += message.size();
        state
            .by_subject
            .entry(message.subject.clone())
            .or_default()
            .insert(message.sequence);
        state.messages.insert(message.sequence, message.clone());
        Ok(())
    }

    async fn get(&self, sequence: u64) -> Result<Option<StoredMessage>> {
        Ok(self.state.read().await.messages.get(&sequence).cloned())
    }

    async fn range(&self, from: u64, limit: usize) -> Result<Vec<StoredMessage>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .range(from..)
            .take(limit)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn last_for_subject(&self, subject: &str) -> Result<Option<StoredMessage>> {
        let state = self.state.read().await;
        Ok(state
            .by_subject
            .get(subject)
            .and_then(|seqs| seqs.last())
            .and_then(|seq| state.messages.get(seq))
            .cloned())
    }

    async fn sequences_for_subject(&self, subject: &str) -> Result<Vec<u64>> {
        let state = self.state.read().await;
        Ok(state
            .by_subject
            .get(subject)
            .map(|seqs| seqs.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn remove(&self, sequence: u64) -> Result<Option<u64>> {
        let mut state = self.state.write().await;
        let Some(message) = state.messages.remove(&sequence) else {
            return Ok(None);
        };
        let size = message.size();
        state.bytes -= size;
        if let Some(seqs) = state.by_subject.get_mut(&message.subject) {
            seqs.remove(&sequence);
            if seqs.is_empty() {
                state.by_subject.remove(&message.subject);
            }
        }
        Ok(Some(size))
    }

    async fn purge(&self) -> Result<u64> {
        let mut state = self.state.write().await;
        let removed = state.messages.len() as u64;
        state.messages.clear();
        state.by_subject.clear();
        state.bytes = 0;
        Ok(removed)
    }

    async fn state(&self) -> Result<StoreState> {
        let state = self.state.read().await;
        let first_seq = match state.messages.keys().next() {
            Some(seq) => *seq,
            None if state.last_seq == 0 => 0,
            None => state.last_seq + 1,
        };
        Ok(StoreState {
            messages: state.messages.len() as u64,
            bytes: state.bytes,
            first_seq,
            last_seq: state.last_seq,
            num_subjects: state.by_subject.len() as u64,
        })
    }

    async fn destroy(&self) -> Result<()> {
        *self.state.write().await = MessageState::default();
        Ok(())
    }
}

/// Cursor store that keeps cursors in memory.
#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<String, u64>>,
    fail_on_put: RwLock<bool>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_put(&self, fail: bool) {
        *self.fail_on_put.write().await = fail;
    }

    pub async fn stored_count(&self) -> usize {
        self.cursors.read().await.len()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, binding: &str) -> Result<Option<u64>> {
        Ok(self.cursors.read().await.get(binding).copied())
    }

    async fn put(&self, binding: &str, sequence: u64) -> Result<()> {
        if *self.fail_on_put.read().await {
            return Err(StorageError::Unavailable("cursor writes disabled".to_string()));
        }
        self.cursors
            .write()
            .await
            .insert(binding.to_string(), sequence);
        Ok(())
    }

    async fn delete(&self, binding: &str) -> Result<()> {
        self.cursors.write().await.remove(binding);
        Ok(())
    }
}

/// Stream catalog that keeps definitions in memory.
#[derive(Default)]
pub struct MemoryCatalog {
    streams: RwLock<Vec<(String, StreamConfig)>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StreamCatalog for MemoryCatalog {
    async fn save(&self, account: &str, config: &StreamConfig) -> Result<()> {
        let mut streams = self.streams.write().await;
        match streams
            .iter_mut()
            .find(|(a, c)| a == account && c.name == config.name)
        {
            Some(entry) => entry.1 = config.clone(),
            None => streams.push((account.to_string(), config.clone())),
        }
        Ok(())
    }

    async fn remove(&self, account: &str, stream: &str) -> Result<()> {
        self.streams
            .write()
            .await
            .retain(|(a, c)| !(a == account && c.name == stream));
        Ok(())
    }

    async fn load(&self) -> Result<Vec<(String, StreamConfig)>> {
        Ok(self.streams.read().await.clone())
    }
}
