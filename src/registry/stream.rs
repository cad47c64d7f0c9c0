//! One stream: its single writer, limit enforcement, retention and
//! consumer ack floors.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::{Result, StreamError};
use crate::account::AccountId;
use crate::config::{limit, DiscardPolicy, RetentionPolicy, StreamConfig};
use crate::message::{
    Message, StoredMessage, MSG_ID_HEADER, ROLLUP_ALL, ROLLUP_HEADER, ROLLUP_SUBJECT,
};
use crate::publish::PubAck;
use crate::storage::MessageStore;
use crate::subject::{any_matches, SubjectFilter};

/// Change notifications broadcast by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// A message was stored at this sequence.
    Appended(u64),
    /// Every stored message was removed.
    Purged,
    /// The stream was deleted.
    Deleted,
}

/// Consumer registration, unique within one stream.
pub type ConsumerId = u64;

/// Counters reported by `info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamState {
    pub messages: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub consumer_count: usize,
    pub num_subjects: u64,
}

/// Stream definition plus current state.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub account: AccountId,
    pub config: StreamConfig,
    pub created: DateTime<Utc>,
    pub state: StreamState,
}

/// Selects a single stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageQuery {
    Sequence(u64),
    LastBySubject(String),
}

impl fmt::Display for MessageQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageQuery::Sequence(seq) => write!(f, "sequence {seq}"),
            MessageQuery::LastBySubject(subject) => write!(f, "last on '{subject}'"),
        }
    }
}

enum Rollup {
    Subject,
    All,
}

/// State owned by the single writer.
struct Writer {
    messages: u64,
    bytes: u64,
    first_seq: u64,
    last_seq: u64,
    /// Msg-Id -> (sequence, accepted at).
    dedupe: HashMap<String, (u64, Instant)>,
    /// Consumer -> highest acknowledged sequence.
    consumers: BTreeMap<ConsumerId, u64>,
    next_consumer: ConsumerId,
}

impl Writer {
    fn duplicate_of(&mut self, id: &str, window: Option<Duration>) -> Option<u64> {
        let window = window?;
        self.dedupe.retain(|_, (_, at)| at.elapsed() < window);
        self.dedupe.get(id).map(|(seq, _)| *seq)
    }
}

/// A stream within one account.
///
/// Every mutation goes through the writer mutex, so concurrent publishers
/// receive strictly increasing, collision-free sequences. Reads go straight
/// to the store.
pub struct Stream {
    account: AccountId,
    config: StreamConfig,
    filters: Vec<SubjectFilter>,
    created: DateTime<Utc>,
    store: Arc<dyn MessageStore>,
    writer: Mutex<Writer>,
    events: broadcast::Sender<StreamEvent>,
    deleted: AtomicBool,
}

impl Stream {
    pub(crate) async fn open(
        account: AccountId,
        config: StreamConfig,
        filters: Vec<SubjectFilter>,
        store: Arc<dyn MessageStore>,
        channel_capacity: usize,
    ) -> Result<Self> {
        let state = store.state().await?;
        let (events, _) = broadcast::channel(channel_capacity);

        Ok(Self {
            account,
            config,
            filters,
            created: Utc::now(),
            store,
            writer: Mutex::new(Writer {
                messages: state.messages,
                bytes: state.bytes,
                first_seq: state.first_seq,
                last_seq: state.last_seq,
                dedupe: HashMap::new(),
                consumers: BTreeMap::new(),
                next_consumer: 1,
            }),
            events,
            deleted: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn filters(&self) -> &[SubjectFilter] {
        &self.filters
    }

    /// Whether a publish on `subject` belongs to this stream.
    pub fn admits(&self, subject: &str) -> bool {
        any_matches(&self.filters, subject)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(StreamError::NotFound {
                account: self.account.to_string(),
                stream: self.name().to_string(),
            });
        }
        Ok(())
    }

    fn limit_exceeded(&self, reason: impl Into<String>) -> StreamError {
        StreamError::LimitExceeded {
            stream: self.name().to_string(),
            reason: reason.into(),
        }
    }

    /// Live notifications of appends, purges and deletion.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Append a published message. The subject must match the stream's filters.
    pub async fn append(&self, message: Message) -> Result<PubAck> {
        if !self.admits(message.subject.as_str()) {
            return Err(StreamError::SubjectNotMatched {
                stream: self.name().to_string(),
                subject: message.subject.to_string(),
            });
        }
        self.store_message(message).await
    }

    /// Append a message sourced from another stream. Subject filters do not apply.
    pub async fn append_sourced(&self, message: Message) -> Result<PubAck> {
        self.store_message(message).await
    }

    async fn store_message(&self, message: Message) -> Result<PubAck> {
        let mut writer = self.writer.lock().await;
        self.ensure_open()?;

        if self.config.sealed {
            return Err(StreamError::Sealed(self.name().to_string()));
        }

        let size = message.size() as u64;
        if let Some(max) = limit(self.config.max_msg_size) {
            if size > max {
                return Err(self.limit_exceeded(format!("message size {size} exceeds maximum {max}")));
            }
        }
        if let Some(max) = limit(self.config.max_bytes) {
            if size > max {
                return Err(self.limit_exceeded(format!("message size {size} exceeds max_bytes {max}")));
            }
        }

        let msg_id = message.headers.get(MSG_ID_HEADER).map(str::to_string);
        if let Some(id) = &msg_id {
            if let Some(sequence) = writer.duplicate_of(id, self.config.duplicate_window()) {
                debug!(stream = %self.name(), msg_id = %id, sequence, "Duplicate message ignored");
                return Ok(PubAck {
                    stream: self.name().to_string(),
                    sequence,
                    duplicate: true,
                });
            }
        }

        let rollup = match message.headers.get(ROLLUP_HEADER) {
            None => None,
            Some(_) if !self.config.allow_rollup_hdrs => {
                return Err(StreamError::RollupDenied(self.name().to_string()));
            }
            Some(ROLLUP_SUBJECT) => Some(Rollup::Subject),
            Some(ROLLUP_ALL) => Some(Rollup::All),
            Some(other) => return Err(StreamError::InvalidRollup(other.to_string())),
        };

        self.expire_aged(&mut writer).await?;

        if self.config.discard == DiscardPolicy::New {
            if let Some(max) = limit(self.config.max_msgs) {
                if writer.messages >= max {
                    return Err(self.limit_exceeded("maximum messages exceeded"));
                }
            }
            if let Some(max) = limit(self.config.max_bytes) {
                if writer.bytes + size > max {
                    return Err(self.limit_exceeded("maximum bytes exceeded"));
                }
            }
        }

        let sequence = writer.last_seq + 1;
        let stored = StoredMessage::from_message(message, sequence, Utc::now());
        self.store.append(&stored).await?;

        writer.last_seq = sequence;
        writer.messages += 1;
        writer.bytes += stored.size();
        if writer.messages == 1 {
            writer.first_seq = sequence;
        }
        if let Some(id) = msg_id {
            writer.dedupe.insert(id, (sequence, Instant::now()));
        }

        if let Err(e) = self.after_append(&mut writer, rollup, &stored).await {
            warn!(stream = %self.name(), sequence, error = %e, "Post-append cleanup failed");
        }

        let _ = self.events.send(StreamEvent::Appended(sequence));
        debug!(stream = %self.name(), subject = %stored.subject, sequence, "Message stored");

        Ok(PubAck {
            stream: self.name().to_string(),
            sequence,
            duplicate: false,
        })
    }

    /// Rollups and discard-old limits, applied once the new message is durable.
    async fn after_append(
        &self,
        writer: &mut Writer,
        rollup: Option<Rollup>,
        newest: &StoredMessage,
    ) -> Result<()> {
        match rollup {
            Some(Rollup::Subject) => self.rollup_subject(writer, newest).await?,
            Some(Rollup::All) => self.rollup_all(writer, newest.sequence).await?,
            None => {}
        }
        self.enforce_limits(writer, &newest.subject).await
    }

    async fn oldest(&self, writer: &Writer) -> Result<Option<StoredMessage>> {
        if writer.messages == 0 {
            return Ok(None);
        }
        Ok(self.store.range(writer.first_seq, 1).await?.into_iter().next())
    }

    async fn remove_locked(&self, writer: &mut Writer, sequence: u64) -> Result<bool> {
        let Some(size) = self.store.remove(sequence).await? else {
            return Ok(false);
        };
        writer.messages -= 1;
        writer.bytes = writer.bytes.saturating_sub(size);
        if sequence == writer.first_seq {
            writer.first_seq = self
                .store
                .range(sequence + 1, 1)
                .await?
                .first()
                .map(|m| m.sequence)
                .unwrap_or(writer.last_seq + 1);
        }
        Ok(true)
    }

    async fn evict_oldest(&self, writer: &mut Writer) -> Result<bool> {
        match self.oldest(writer).await? {
            Some(oldest) => self.remove_locked(writer, oldest.sequence).await,
            None => Ok(false),
        }
    }

    async fn enforce_limits(&self, writer: &mut Writer, subject: &str) -> Result<()> {
        let mut evicted = 0u64;

        if let Some(max) = limit(self.config.max_msgs) {
            while writer.messages > max && self.evict_oldest(writer).await? {
                evicted += 1;
            }
        }
        if let Some(max) = limit(self.config.max_bytes) {
            while writer.bytes > max && self.evict_oldest(writer).await? {
                evicted += 1;
            }
        }
        if let Some(max) = limit(self.config.max_msgs_per_subject) {
            let sequences = self.store.sequences_for_subject(subject).await?;
            let excess = sequences.len().saturating_sub(max as usize);
            for sequence in &sequences[..excess] {
                if self.remove_locked(writer, *sequence).await? {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            debug!(stream = %self.name(), evicted, first_seq = writer.first_seq, "Evicted messages over limits");
        }
        Ok(())
    }

    async fn expire_aged(&self, writer: &mut Writer) -> Result<()> {
        let Some(max_age) = self.config.max_age() else {
            return Ok(());
        };
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Ok(());
        };
        let cutoff = Utc::now() - max_age;

        while let Some(oldest) = self.oldest(writer).await? {
            if oldest.timestamp >= cutoff {
                break;
            }
            self.remove_locked(writer, oldest.sequence).await?;
        }
        Ok(())
    }

    async fn rollup_subject(&self, writer: &mut Writer, newest: &StoredMessage) -> Result<()> {
        for sequence in self.store.sequences_for_subject(&newest.subject).await? {
            if sequence < newest.sequence {
                self.remove_locked(writer, sequence).await?;
            }
        }
        Ok(())
    }

    async fn rollup_all(&self, writer: &mut Writer, newest: u64) -> Result<()> {
        while let Some(oldest) = self.oldest(writer).await? {
            if oldest.sequence >= newest {
                break;
            }
            self.remove_locked(writer, oldest.sequence).await?;
        }
        Ok(())
    }

    /// Current definition and counters.
    pub async fn info(&self) -> Result<StreamInfo> {
        let mut writer = self.writer.lock().await;
        self.ensure_open()?;
        self.expire_aged(&mut writer).await?;
        let store_state = self.store.state().await?;

        Ok(StreamInfo {
            account: self.account.clone(),
            config: self.config.clone(),
            created: self.created,
            state: StreamState {
                messages: writer.messages,
                bytes: writer.bytes,
                first_seq: writer.first_seq,
                last_seq: writer.last_seq,
                consumer_count: writer.consumers.len(),
                num_subjects: store_state.num_subjects,
            },
        })
    }

    pub async fn get_message(&self, query: &MessageQuery) -> Result<StoredMessage> {
        self.ensure_open()?;
        let found = match query {
            MessageQuery::Sequence(sequence) => self.store.get(*sequence).await?,
            MessageQuery::LastBySubject(subject) => self.store.last_for_subject(subject).await?,
        };
        found.ok_or_else(|| StreamError::MessageNotFound {
            stream: self.name().to_string(),
            query: query.to_string(),
        })
    }

    /// `get_message` for clients reading without a consumer; requires `allow_direct`.
    pub async fn direct_get(&self, query: &MessageQuery) -> Result<StoredMessage> {
        if !self.config.allow_direct {
            return Err(StreamError::DirectGetDenied(self.name().to_string()));
        }
        self.get_message(query).await
    }

    /// Stored messages with sequence >= `from`, ascending, at most `batch`.
    ///
    /// Returns the messages and the last assigned sequence at read time.
    pub(crate) async fn fetch(&self, from: u64, batch: usize) -> Result<(Vec<StoredMessage>, u64)> {
        let last_seq = {
            let mut writer = self.writer.lock().await;
            self.ensure_open()?;
            self.expire_aged(&mut writer).await?;
            writer.last_seq
        };
        let messages = self.store.range(from, batch).await?;
        Ok((messages, last_seq))
    }

    pub async fn delete_message(&self, sequence: u64) -> Result<()> {
        if self.config.deny_delete {
            return Err(StreamError::DeleteDenied(self.name().to_string()));
        }
        if self.config.sealed {
            return Err(StreamError::Sealed(self.name().to_string()));
        }

        let mut writer = self.writer.lock().await;
        self.ensure_open()?;
        if !self.remove_locked(&mut writer, sequence).await? {
            return Err(StreamError::MessageNotFound {
                stream: self.name().to_string(),
                query: MessageQuery::Sequence(sequence).to_string(),
            });
        }
        Ok(())
    }

    /// Remove every message. `last_seq` is kept.
    pub async fn purge(&self) -> Result<u64> {
        if self.config.deny_purge {
            return Err(StreamError::PurgeDenied(self.name().to_string()));
        }
        if self.config.sealed {
            return Err(StreamError::Sealed(self.name().to_string()));
        }

        let mut writer = self.writer.lock().await;
        self.ensure_open()?;
        let purged = self.store.purge().await?;
        writer.messages = 0;
        writer.bytes = 0;
        writer.first_seq = writer.last_seq + 1;

        let _ = self.events.send(StreamEvent::Purged);
        info!(stream = %self.name(), purged, "Stream purged");
        Ok(purged)
    }

    /// Register a consumer whose acks drive interest and work-queue retention.
    pub(crate) async fn register_consumer(&self) -> Result<ConsumerId> {
        let mut writer = self.writer.lock().await;
        self.ensure_open()?;

        if let Some(max) = limit(self.config.max_consumers) {
            if writer.consumers.len() as u64 >= max {
                return Err(self.limit_exceeded(format!("maximum consumers {max} reached")));
            }
        }
        if self.config.retention == RetentionPolicy::WorkQueue && !writer.consumers.is_empty() {
            return Err(StreamError::ConsumerConflict(self.name().to_string()));
        }

        let id = writer.next_consumer;
        writer.next_consumer += 1;
        writer.consumers.insert(id, 0);
        debug!(stream = %self.name(), consumer = id, "Consumer registered");
        Ok(id)
    }

    pub(crate) async fn unregister_consumer(&self, id: ConsumerId) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if writer.consumers.remove(&id).is_some() {
            debug!(stream = %self.name(), consumer = id, "Consumer removed");
        }
        if self.is_deleted() {
            return Ok(());
        }
        self.apply_retention(&mut writer).await
    }

    /// Record that `id` has processed everything up to `sequence`.
    pub(crate) async fn ack(&self, id: ConsumerId, sequence: u64) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.ensure_open()?;
        if let Some(floor) = writer.consumers.get_mut(&id) {
            *floor = (*floor).max(sequence);
        }
        self.apply_retention(&mut writer).await
    }

    pub async fn consumer_count(&self) -> usize {
        self.writer.lock().await.consumers.len()
    }

    /// Drop messages every registered consumer has acknowledged.
    ///
    /// Without consumers, interest and work-queue streams retain like `limits`.
    async fn apply_retention(&self, writer: &mut Writer) -> Result<()> {
        if self.config.retention == RetentionPolicy::Limits {
            return Ok(());
        }
        let Some(floor) = writer.consumers.values().min().copied() else {
            return Ok(());
        };
        while let Some(oldest) = self.oldest(writer).await? {
            if oldest.sequence > floor {
                break;
            }
            self.remove_locked(writer, oldest.sequence).await?;
        }
        Ok(())
    }

    /// Mark deleted, wake subscribers and drop stored data.
    pub(crate) async fn close(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.deleted.store(true, Ordering::Release);
        let _ = self.events.send(StreamEvent::Deleted);
        self.store.destroy().await?;
        Ok(())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("account", &self.account)
            .field("name", &self.config.name)
            .finish()
    }
}
