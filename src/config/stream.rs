//! Stream configuration schema.
//!
//! JSON-shaped, field-compatible with JetStream stream configs so existing
//! definitions (`testA.json`, `testB.json`) deserialize unchanged.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default duplicate window (2 minutes, in nanoseconds).
pub const DEFAULT_DUPLICATE_WINDOW_NS: i64 = 120_000_000_000;

/// Message retention policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep messages until a size/count/age limit evicts them.
    #[default]
    Limits,
    /// Keep messages until every registered consumer has acknowledged them.
    Interest,
    /// Keep messages until the single registered consumer acknowledges them.
    #[serde(rename = "workqueue")]
    WorkQueue,
}

/// Where stream messages live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// What happens when a stream hits a count or size limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Evict the oldest messages to make room.
    #[default]
    Old,
    /// Reject the new message.
    New,
}

/// External API reference for sourcing from another account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSourceConfig {
    /// External API address, e.g. `$JS.testA.API`.
    pub api: String,
    /// Deliver prefix the bridge delivers sourced messages under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver: Option<String>,
}

/// One upstream a stream sources from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Upstream stream name.
    pub name: String,
    /// Narrowing filter; `None` or `>` admits everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    /// Present when the upstream lives in another account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalSourceConfig>,
}

/// Stream definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subjects: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceConfig>,
    pub retention: RetentionPolicy,
    pub max_consumers: i64,
    pub max_msgs_per_subject: i64,
    pub max_msgs: i64,
    pub max_bytes: i64,
    /// Nanoseconds; 0 means unlimited.
    pub max_age: i64,
    pub max_msg_size: i64,
    pub storage: StorageType,
    pub discard: DiscardPolicy,
    pub num_replicas: i64,
    /// Nanoseconds.
    pub duplicate_window: i64,
    pub sealed: bool,
    pub deny_delete: bool,
    pub deny_purge: bool,
    pub allow_rollup_hdrs: bool,
    pub allow_direct: bool,
    pub mirror_direct: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            sources: Vec::new(),
            retention: RetentionPolicy::Limits,
            max_consumers: -1,
            max_msgs_per_subject: -1,
            max_msgs: -1,
            max_bytes: -1,
            max_age: 0,
            max_msg_size: -1,
            storage: StorageType::File,
            discard: DiscardPolicy::Old,
            num_replicas: 1,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW_NS,
            sealed: false,
            deny_delete: false,
            deny_purge: false,
            allow_rollup_hdrs: false,
            allow_direct: false,
            mirror_direct: false,
        }
    }
}

/// Interpret a JetStream-style limit: zero or negative means unlimited.
pub fn limit(value: i64) -> Option<u64> {
    (value > 0).then_some(value as u64)
}

impl StreamConfig {
    /// Create a config with defaults and the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON stream definition.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age > 0).then(|| Duration::from_nanos(self.max_age as u64))
    }

    pub fn duplicate_window(&self) -> Option<Duration> {
        (self.duplicate_window > 0).then(|| Duration::from_nanos(self.duplicate_window as u64))
    }

    /// Subject filters the stream accepts publishes on.
    ///
    /// A stream with neither subjects nor sources listens on its own name.
    pub fn effective_subjects(&self) -> Vec<String> {
        if self.subjects.is_empty() && self.sources.is_empty() {
            vec![self.name.clone()]
        } else {
            self.subjects.clone()
        }
    }
}

impl SourceConfig {
    /// Source a stream in the same account.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter_subject: None,
            external: None,
        }
    }

    /// Source a stream exported by another account.
    pub fn external(name: impl Into<String>, api: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter_subject: None,
            external: Some(ExternalSourceConfig {
                api: api.into(),
                deliver: None,
            }),
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter_subject = Some(filter.into());
        self
    }

    pub fn with_deliver(mut self, deliver: impl Into<String>) -> Self {
        if let Some(external) = self.external.as_mut() {
            external.deliver = Some(deliver.into());
        }
        self
    }
}
