//! Messages as published and as stored in a stream.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subject::Subject;

/// Publisher-supplied id used for de-duplication inside a stream's duplicate window.
pub const MSG_ID_HEADER: &str = "Msg-Id";
/// Rollup request header. Values: [`ROLLUP_SUBJECT`] or [`ROLLUP_ALL`].
pub const ROLLUP_HEADER: &str = "Rollup";
/// Roll up older messages on the same subject.
pub const ROLLUP_SUBJECT: &str = "sub";
/// Roll up every older message in the stream.
pub const ROLLUP_ALL: &str = "all";
/// Set on sourced messages: `<account>.<stream>` they were sourced from.
pub const SOURCE_HEADER: &str = "Stream-Source";
/// Set on sourced messages: upstream sequence they were sourced from.
pub const SOURCE_SEQUENCE_HEADER: &str = "Stream-Source-Sequence";

/// Ordered header multimap. Names compare case-sensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value; existing values under the same name are kept.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace every value under `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(n, _)| *n != name);
        self.0.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| n != name);
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encoded size used for byte accounting (`name: value\r\n` per entry).
    pub fn encoded_len(&self) -> usize {
        self.0.iter().map(|(n, v)| n.len() + v.len() + 4).sum()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A message on its way into a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: Subject,
    pub payload: Bytes,
    pub headers: Headers,
}

impl Message {
    pub fn new(subject: Subject, payload: impl Into<Bytes>) -> Self {
        Self {
            subject,
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Size counted against `max_msg_size` and `max_bytes`.
    pub fn size(&self) -> usize {
        self.subject.as_str().len() + self.payload.len() + self.headers.encoded_len()
    }
}

/// A message persisted in a stream at a given sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub sequence: u64,
    pub subject: String,
    pub payload: Bytes,
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
}

impl StoredMessage {
    /// Stamp a message with its stream sequence and append time.
    pub fn from_message(message: Message, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence,
            subject: message.subject.as_str().to_string(),
            payload: message.payload,
            headers: message.headers,
            timestamp,
        }
    }

    pub fn size(&self) -> u64 {
        (self.subject.len() + self.payload.len() + self.headers.encoded_len()) as u64
    }
}
