//! Stream registry: stream definitions scoped per account.
//!
//! Streams are created and deleted here; the publish path routes into them
//! (see `publish`). Within one account, the subject filters of different
//! streams must not overlap, so any published subject resolves to at most
//! one stream.

mod stream;

pub use stream::{
    ConsumerId, MessageQuery, Stream, StreamEvent, StreamInfo, StreamState,
};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::account::{AccountId, AccountTable, AuthError};
use crate::config::{limit, AccountLimits, StorageType, StreamConfig};
use crate::error::ErrorKind;
use crate::message::{Message, StoredMessage};
use crate::publish::{PubAck, API_PREFIX};
use crate::storage::{Storage, StorageError};
use crate::subject::{SubjectError, SubjectFilter};

/// Stream registry errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Stream name already in use: {account}.{stream}")]
    DuplicateName { account: String, stream: String },

    #[error("Invalid stream name '{0}'")]
    InvalidName(String),

    #[error("Invalid filter set: {0}")]
    InvalidFilterSet(String),

    #[error("Invalid limits: {0}")]
    InvalidLimits(String),

    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported stream configuration: {0}")]
    Unsupported(String),

    #[error("Stream not found: {account}.{stream}")]
    NotFound { account: String, stream: String },

    #[error("No stream in account {account} matches subject '{subject}'")]
    NoMatchingStream { account: String, subject: String },

    #[error("Subject '{subject}' does not match stream {stream}")]
    SubjectNotMatched { stream: String, subject: String },

    #[error("Message not found in stream {stream}: {query}")]
    MessageNotFound { stream: String, query: String },

    #[error("Stream {stream}: {reason}")]
    LimitExceeded { stream: String, reason: String },

    #[error("Account {account} reached its limit of {max} streams")]
    TooManyStreams { account: String, max: u64 },

    #[error("Stream {0} is sealed")]
    Sealed(String),

    #[error("Message deletion not permitted on stream {0}")]
    DeleteDenied(String),

    #[error("Purge not permitted on stream {0}")]
    PurgeDenied(String),

    #[error("Rollup headers not permitted on stream {0}")]
    RollupDenied(String),

    #[error("Invalid rollup value '{0}'")]
    InvalidRollup(String),

    #[error("Direct get not permitted on stream {0}")]
    DirectGetDenied(String),

    #[error("Subject '{0}' is reserved for the stream API")]
    ReservedSubject(String),

    #[error("Stream {0} uses work-queue retention and already has a consumer")]
    ConsumerConflict(String),

    #[error(transparent)]
    Subject(#[from] SubjectError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::DuplicateName { .. }
            | StreamError::InvalidFilterSet(_)
            | StreamError::InvalidLimits(_)
            | StreamError::InvalidConfig(_)
            | StreamError::Unsupported(_)
            | StreamError::ConsumerConflict(_) => ErrorKind::Configuration,
            StreamError::NotFound { .. }
            | StreamError::NoMatchingStream { .. }
            | StreamError::MessageNotFound { .. } => ErrorKind::NotFound,
            StreamError::LimitExceeded { .. } | StreamError::TooManyStreams { .. } => {
                ErrorKind::LimitExceeded
            }
            StreamError::Sealed(_)
            | StreamError::DeleteDenied(_)
            | StreamError::PurgeDenied(_)
            | StreamError::RollupDenied(_)
            | StreamError::DirectGetDenied(_)
            | StreamError::ReservedSubject(_) => ErrorKind::PermissionDenied,
            StreamError::InvalidName(_)
            | StreamError::SubjectNotMatched { .. }
            | StreamError::InvalidRollup(_)
            | StreamError::Subject(_) => ErrorKind::InvalidRequest,
            StreamError::Auth(e) => e.kind(),
            StreamError::Storage(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

/// Every stream of every account.
pub struct StreamRegistry {
    accounts: Arc<AccountTable>,
    storage: Storage,
    channel_capacity: usize,
    streams: RwLock<HashMap<AccountId, BTreeMap<String, Arc<Stream>>>>,
}

impl StreamRegistry {
    pub fn new(accounts: Arc<AccountTable>, storage: Storage, channel_capacity: usize) -> Self {
        Self {
            accounts,
            storage,
            channel_capacity,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Create a stream. File-backed definitions are recorded in the catalog.
    pub async fn create_stream(&self, account: &AccountId, config: StreamConfig) -> Result<Arc<Stream>> {
        self.open_stream(account, config, true).await
    }

    /// Re-open a stream recorded in the catalog after a restart.
    pub(crate) async fn restore_stream(
        &self,
        account: &AccountId,
        config: StreamConfig,
    ) -> Result<Arc<Stream>> {
        self.open_stream(account, config, false).await
    }

    async fn open_stream(
        &self,
        account: &AccountId,
        config: StreamConfig,
        persist: bool,
    ) -> Result<Arc<Stream>> {
        let limits = self.accounts.get(account)?.limits.clone();
        validate_name(&config.name)?;
        validate_limits(&config, &limits)?;
        let filters = parse_filters(&config)?;

        let mut streams = self.streams.write().await;
        let owned = streams.entry(account.clone()).or_default();

        if owned.contains_key(&config.name) {
            return Err(StreamError::DuplicateName {
                account: account.to_string(),
                stream: config.name,
            });
        }
        if let Some(max) = limit(limits.max_streams) {
            if owned.len() as u64 >= max {
                return Err(StreamError::TooManyStreams {
                    account: account.to_string(),
                    max,
                });
            }
        }
        for (name, other) in owned.iter() {
            for filter in &filters {
                if let Some(clash) = other.filters().iter().find(|f| filter.overlaps(f)) {
                    return Err(StreamError::InvalidFilterSet(format!(
                        "subject '{filter}' overlaps '{clash}' of stream {name}"
                    )));
                }
            }
        }

        let store = self
            .storage
            .message_store(account.as_str(), &config.name, config.storage)
            .await?;
        if persist && config.storage == StorageType::File {
            self.storage.catalog().save(account.as_str(), &config).await?;
        }

        let name = config.name.clone();
        let stream = Arc::new(
            Stream::open(account.clone(), config, filters, store, self.channel_capacity).await?,
        );
        info!(
            account = %account,
            stream = %name,
            subjects = ?stream.config().effective_subjects(),
            storage = ?stream.config().storage,
            restored = !persist,
            "Stream ready"
        );
        owned.insert(name, stream.clone());
        Ok(stream)
    }

    pub async fn get(&self, account: &AccountId, name: &str) -> Result<Arc<Stream>> {
        self.streams
            .read()
            .await
            .get(account)
            .and_then(|owned| owned.get(name))
            .cloned()
            .ok_or_else(|| StreamError::NotFound {
                account: account.to_string(),
                stream: name.to_string(),
            })
    }

    /// Stream names of one account, sorted.
    pub async fn list_streams(&self, account: &AccountId) -> Vec<String> {
        self.streams
            .read()
            .await
            .get(account)
            .map(|owned| owned.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) async fn streams_of(&self, account: &AccountId) -> Vec<Arc<Stream>> {
        self.streams
            .read()
            .await
            .get(account)
            .map(|owned| owned.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a stream and its stored data.
    pub async fn delete_stream(&self, account: &AccountId, name: &str) -> Result<Arc<Stream>> {
        let stream = {
            let mut streams = self.streams.write().await;
            streams
                .get_mut(account)
                .and_then(|owned| owned.remove(name))
                .ok_or_else(|| StreamError::NotFound {
                    account: account.to_string(),
                    stream: name.to_string(),
                })?
        };

        stream.close().await?;
        if stream.config().storage == StorageType::File {
            self.storage.catalog().remove(account.as_str(), name).await?;
        }
        info!(account = %account, stream = %name, "Stream deleted");
        Ok(stream)
    }

    /// Append to a named stream; the subject must match its filters.
    pub async fn append(
        &self,
        account: &AccountId,
        stream: &str,
        message: Message,
    ) -> Result<PubAck> {
        self.get(account, stream).await?.append(message).await
    }

    pub async fn info(&self, account: &AccountId, stream: &str) -> Result<StreamInfo> {
        self.get(account, stream).await?.info().await
    }

    pub async fn get_message(
        &self,
        account: &AccountId,
        stream: &str,
        query: &MessageQuery,
    ) -> Result<StoredMessage> {
        self.get(account, stream).await?.get_message(query).await
    }
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\'));
    if invalid {
        return Err(StreamError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn validate_limits(config: &StreamConfig, account: &AccountLimits) -> Result<()> {
    if config.num_replicas > 1 {
        return Err(StreamError::Unsupported(format!(
            "num_replicas = {}, replication is not supported",
            config.num_replicas
        )));
    }

    let counts = [
        ("max_consumers", config.max_consumers),
        ("max_msgs_per_subject", config.max_msgs_per_subject),
        ("max_msgs", config.max_msgs),
        ("max_bytes", config.max_bytes),
        ("max_msg_size", config.max_msg_size),
    ];
    if let Some((field, value)) = counts.iter().find(|(_, v)| *v < -1) {
        return Err(StreamError::InvalidLimits(format!(
            "{field} = {value}, expected -1 or a non-negative value"
        )));
    }
    if config.max_age < 0 || config.duplicate_window < 0 {
        return Err(StreamError::InvalidLimits(
            "max_age and duplicate_window must not be negative".to_string(),
        ));
    }
    if config.max_age > 0 && config.duplicate_window > config.max_age {
        return Err(StreamError::InvalidLimits(
            "duplicate_window must not exceed max_age".to_string(),
        ));
    }

    if let Some(account_max) = limit(account.max_bytes) {
        match limit(config.max_bytes) {
            Some(stream_max) if stream_max <= account_max => {}
            _ => {
                return Err(StreamError::InvalidLimits(format!(
                    "max_bytes must be set and at most the account limit of {account_max}"
                )));
            }
        }
    }
    Ok(())
}

fn parse_filters(config: &StreamConfig) -> Result<Vec<SubjectFilter>> {
    let mut seen = HashSet::new();
    let mut filters = Vec::new();
    for raw in config.effective_subjects() {
        if raw.starts_with(API_PREFIX) {
            return Err(StreamError::InvalidFilterSet(format!(
                "subject '{raw}' is reserved for the stream API"
            )));
        }
        let filter =
            SubjectFilter::new(raw.as_str()).map_err(|e| StreamError::InvalidFilterSet(e.to_string()))?;
        if !seen.insert(raw.clone()) {
            return Err(StreamError::InvalidFilterSet(format!("duplicate subject '{raw}'")));
        }
        filters.push(filter);
    }
    Ok(filters)
}
