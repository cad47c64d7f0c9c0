//! Capability handles handed out by the bridge.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{ApiOperation, BridgeError, ExternalApiAddress, Result};
use crate::account::AccountId;
use crate::config::RetentionPolicy;
use crate::message::{Message, StoredMessage};
use crate::publish::PubAck;
use crate::registry::{ConsumerId, Stream, StreamEvent, StreamInfo};
use crate::subject::SubjectFilter;

/// Reachability of an external API address.
#[derive(Debug)]
pub struct Link {
    connected: AtomicBool,
}

impl Link {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn check(&self, address: &ExternalApiAddress) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BridgeError::Disconnected(address.to_string()))
        }
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only handle on one stream, possibly owned by another account.
///
/// Only the operations in [`ApiOperation::READ_ONLY`] succeed; publish,
/// delete and list fail with `PermissionDenied` whoever holds the handle.
#[derive(Clone)]
pub struct ExportedStream {
    stream: Arc<Stream>,
    /// `None` for same-account handles.
    address: Option<ExternalApiAddress>,
    scope: SubjectFilter,
    link: Arc<Link>,
}

impl ExportedStream {
    pub(crate) fn external(
        stream: Arc<Stream>,
        address: ExternalApiAddress,
        scope: SubjectFilter,
        link: Arc<Link>,
    ) -> Self {
        Self {
            stream,
            address: Some(address),
            scope,
            link,
        }
    }

    pub(crate) fn local(stream: Arc<Stream>) -> Self {
        Self {
            stream,
            address: None,
            scope: SubjectFilter::all(),
            link: Arc::new(Link::new()),
        }
    }

    pub fn stream_name(&self) -> &str {
        self.stream.name()
    }

    /// Owning account of the upstream stream.
    pub fn account(&self) -> &AccountId {
        self.stream.account()
    }

    pub fn address(&self) -> Option<&ExternalApiAddress> {
        self.address.as_ref()
    }

    /// Subjects visible through this handle.
    pub fn scope(&self) -> &SubjectFilter {
        &self.scope
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.stream.config().retention
    }

    pub fn permits(&self, op: ApiOperation) -> bool {
        ApiOperation::READ_ONLY.contains(&op)
    }

    fn refuse(&self, op: ApiOperation) -> BridgeError {
        debug!(stream = %self.stream_name(), op = %op, "Operation refused on exported stream");
        BridgeError::PermissionDenied {
            op,
            stream: self.stream_name().to_string(),
        }
    }

    fn require(&self, op: ApiOperation) -> Result<()> {
        if !self.permits(op) {
            return Err(self.refuse(op));
        }
        match &self.address {
            Some(address) => self.link.check(address),
            None => Ok(()),
        }
    }

    pub async fn info(&self) -> Result<StreamInfo> {
        self.require(ApiOperation::Info)?;
        Ok(self.stream.info().await?)
    }

    /// Register a consumer on the upstream.
    ///
    /// Deliveries are limited to the export scope, further narrowed by
    /// `filter`, and delivered under `deliver.<subject>` when a deliver
    /// prefix is given.
    pub async fn create_consumer(
        &self,
        filter: Option<SubjectFilter>,
        deliver: Option<String>,
    ) -> Result<ScopedConsumer> {
        self.require(ApiOperation::CreateConsumer)?;
        let id = self.stream.register_consumer().await?;
        Ok(ScopedConsumer {
            handle: self.clone(),
            id,
            filter: filter.filter(|f| !f.is_all()),
            deliver,
            closed: false,
        })
    }

    /// Never permitted through a bridge handle.
    pub async fn publish(&self, message: Message) -> Result<PubAck> {
        debug!(subject = %message.subject, "Publish through bridge handle");
        Err(self.refuse(ApiOperation::Publish))
    }

    /// Never permitted through a bridge handle.
    pub async fn delete(&self) -> Result<()> {
        Err(self.refuse(ApiOperation::Delete))
    }

    /// Never permitted through a bridge handle.
    pub async fn list_streams(&self) -> Result<Vec<String>> {
        Err(self.refuse(ApiOperation::List))
    }
}

impl fmt::Debug for ExportedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedStream")
            .field("account", self.account())
            .field("stream", &self.stream_name())
            .field("address", &self.address)
            .field("scope", &self.scope)
            .finish()
    }
}

/// One fetched upstream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Admitted by the consumer's scope; subject carries the deliver prefix.
    Message(StoredMessage),
    /// Stored upstream but outside the consumer's scope.
    Filtered(u64),
}

impl Delivery {
    pub fn sequence(&self) -> u64 {
        match self {
            Delivery::Message(message) => message.sequence,
            Delivery::Filtered(sequence) => *sequence,
        }
    }
}

/// Result of a fetch.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub items: Vec<Delivery>,
    /// Last sequence assigned upstream when the fetch was served.
    pub last_seq: u64,
}

/// An upstream consumer created through a bridge handle.
///
/// The registration lives until [`ScopedConsumer::close`] or drop.
pub struct ScopedConsumer {
    handle: ExportedStream,
    id: ConsumerId,
    filter: Option<SubjectFilter>,
    deliver: Option<String>,
    closed: bool,
}

impl ScopedConsumer {
    pub fn upstream(&self) -> &ExportedStream {
        &self.handle
    }

    pub fn deliver(&self) -> Option<&str> {
        self.deliver.as_deref()
    }

    fn admits(&self, subject: &str) -> bool {
        self.handle.scope.matches(subject)
            && self.filter.as_ref().map_or(true, |f| f.matches(subject))
    }

    /// Up to `batch` stored positions after `after`, in sequence order.
    pub async fn fetch(&self, after: u64, batch: usize) -> Result<Fetched> {
        self.handle.require(ApiOperation::Fetch)?;
        let (messages, last_seq) = self.handle.stream.fetch(after + 1, batch).await?;

        let items = messages
            .into_iter()
            .map(|mut message| {
                if !self.admits(&message.subject) {
                    return Delivery::Filtered(message.sequence);
                }
                if let Some(deliver) = &self.deliver {
                    message.subject = format!("{deliver}.{}", message.subject);
                }
                Delivery::Message(message)
            })
            .collect();
        Ok(Fetched { items, last_seq })
    }

    /// Everything up to `sequence` has been processed.
    pub async fn ack(&self, sequence: u64) -> Result<()> {
        self.handle.require(ApiOperation::Ack)?;
        Ok(self.handle.stream.ack(self.id, sequence).await?)
    }

    /// Live append notifications of the upstream.
    ///
    /// Notifications carry sequences only and cover every append, including
    /// those outside the consumer's scope. [`ScopedConsumer::fetch`] exposes
    /// the same positions as [`Delivery::Filtered`], which the consumer needs
    /// to advance its cursor over them.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<StreamEvent>> {
        self.handle.require(ApiOperation::Subscribe)?;
        Ok(self.handle.stream.subscribe())
    }

    /// Check the upstream can be reached again.
    pub async fn probe(&self) -> Result<()> {
        self.handle.info().await.map(|_| ())
    }

    /// Unregister from the upstream.
    pub async fn close(mut self) {
        self.closed = true;
        unregister(self.handle.stream.clone(), self.id).await;
    }
}

async fn unregister(stream: Arc<Stream>, id: ConsumerId) {
    if let Err(e) = stream.unregister_consumer(id).await {
        debug!(stream = %stream.name(), consumer = id, error = %e, "Consumer close failed");
    }
}

impl Drop for ScopedConsumer {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(unregister(self.handle.stream.clone(), self.id));
            }
            Err(_) => {
                warn!(stream = %self.handle.stream_name(), consumer = self.id, "Consumer dropped outside a runtime, registration kept");
            }
        }
    }
}

impl fmt::Debug for ScopedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedConsumer")
            .field("upstream", &self.handle)
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("deliver", &self.deliver)
            .finish()
    }
}
