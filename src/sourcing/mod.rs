//! Sourcing consumers: one task per binding that tails its upstream and
//! appends admitted messages downstream.
//!
//! Each consumer is an explicit state machine:
//!
//! ```text
//! Initializing ──► CatchingUp ──► SteadyState
//!                   ▲   │  ▲           │
//!                   │   ▼  └── gap ────┘
//!                  Recovering
//!
//! any state ──pause──► Paused ──resume──► CatchingUp
//! any state ──stop───► Stopped
//! ```
//!
//! Delivery is at-least-once: the cursor is persisted after the downstream
//! append, so a crash between the two re-applies one message on restart.
//! Sourced messages carry `Stream-Source` and `Stream-Source-Sequence`
//! headers for deduplication.

mod consumer;

pub(crate) use consumer::SourcingConsumer;

use std::fmt;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::binding::BindingId;
use crate::bridge::BridgeError;
use crate::error::ErrorKind;
use crate::registry::StreamError;
use crate::storage::StorageError;
use crate::subject::SubjectError;

/// Sourcing errors.
#[derive(Debug, thiserror::Error)]
pub enum SourcingError {
    #[error("Upstream {upstream} removed sequences {from}..={to} before they were sourced")]
    MissingUpstream { upstream: String, from: u64, to: u64 },

    #[error("Upstream {0} was deleted")]
    UpstreamDeleted(String),

    #[error("Subject '{subject}' is not under deliver prefix '{deliver}'")]
    DeliverPrefix { subject: String, deliver: String },

    #[error(transparent)]
    Subject(#[from] SubjectError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SourcingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SourcingError::MissingUpstream { .. } | SourcingError::UpstreamDeleted(_) => {
                ErrorKind::NotFound
            }
            SourcingError::DeliverPrefix { .. } | SourcingError::Subject(_) => {
                ErrorKind::InvalidRequest
            }
            SourcingError::Bridge(e) => e.kind(),
            SourcingError::Stream(e) => e.kind(),
            SourcingError::Storage(e) => e.kind(),
        }
    }
}

/// Consumer lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SourcingState {
    #[default]
    Initializing,
    CatchingUp,
    /// Waiting out an unreachable upstream; part of catching up.
    Recovering,
    SteadyState,
    Paused,
    Stopped,
}

impl fmt::Display for SourcingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourcingState::Initializing => "initializing",
            SourcingState::CatchingUp => "catching-up",
            SourcingState::Recovering => "recovering",
            SourcingState::SteadyState => "steady-state",
            SourcingState::Paused => "paused",
            SourcingState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Administrative control of a running consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Stop,
}

/// Last failure seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SourcingError> for StatusError {
    fn from(error: &SourcingError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Observable progress of one binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingStatus {
    pub state: SourcingState,
    /// Last upstream sequence passed, applied or skipped.
    pub cursor: u64,
    /// Messages appended downstream.
    pub applied: u64,
    /// Messages outside the filter.
    pub skipped: u64,
    /// Upstream sequences removed before they could be sourced.
    pub missed: u64,
    pub last_error: Option<StatusError>,
}

/// Owner's side of a running consumer.
pub struct ConsumerHandle {
    id: BindingId,
    control: watch::Sender<Control>,
    status: watch::Receiver<BindingStatus>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn id(&self) -> BindingId {
        self.id
    }

    pub fn status(&self) -> BindingStatus {
        self.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch(&self) -> watch::Receiver<BindingStatus> {
        self.status.clone()
    }

    /// Freeze the cursor until [`ConsumerHandle::resume`].
    pub fn pause(&self) {
        self.control.send_replace(Control::Pause);
    }

    pub fn resume(&self) {
        self.control.send_replace(Control::Run);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the consumer and wait for it to finish.
    ///
    /// The cursor stays at the last applied sequence.
    pub async fn stop(self) {
        self.control.send_replace(Control::Stop);
        if let Err(e) = self.task.await {
            warn!(binding = %self.id, error = %e, "Sourcing task ended abnormally");
        }
        info!(binding = %self.id, "Sourcing consumer stopped");
    }
}
