//! Account-bound client connection.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::Shared;
use crate::account::AccountId;
use crate::binding::{BindingError, BindingId, BindingSpec, StreamKey};
use crate::bridge::{ExportedStream, ExternalApiAddress};
use crate::config::{SourceConfig, StreamConfig};
use crate::error::Result;
use crate::message::{Headers, Message, StoredMessage};
use crate::publish::PubAck;
use crate::registry::{MessageQuery, StreamError, StreamInfo};
use crate::sourcing::BindingStatus;
use crate::subject::Subject;

/// A client authenticated as one account.
///
/// Every operation acts on the connection's own account; other accounts
/// are reachable only through their external API address.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    account: AccountId,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(super) fn new(shared: Arc<Shared>, account: AccountId) -> Self {
        Self { shared, account }
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// This account's external API address.
    pub fn api_address(&self) -> ExternalApiAddress {
        ExternalApiAddress::for_account(&self.account)
    }

    // ========================================================================
    // Streams
    // ========================================================================

    pub async fn add_stream(&self, config: StreamConfig) -> Result<StreamInfo> {
        self.shared.add_stream(&self.account, config).await
    }

    /// Create a stream from its JSON definition.
    pub async fn add_stream_json(&self, json: &str) -> Result<StreamInfo> {
        let config = StreamConfig::from_json(json)
            .map_err(|e| StreamError::InvalidConfig(e.to_string()))?;
        self.add_stream(config).await
    }

    pub async fn delete_stream(&self, stream: &str) -> Result<()> {
        self.shared.delete_stream(&self.account, stream).await
    }

    pub async fn stream_info(&self, stream: &str) -> Result<StreamInfo> {
        Ok(self.shared.registry.info(&self.account, stream).await?)
    }

    pub async fn stream_names(&self) -> Vec<String> {
        self.shared.registry.list_streams(&self.account).await
    }

    pub async fn purge_stream(&self, stream: &str) -> Result<u64> {
        Ok(self.shared.registry.get(&self.account, stream).await?.purge().await?)
    }

    pub async fn delete_message(&self, stream: &str, sequence: u64) -> Result<()> {
        let stream = self.shared.registry.get(&self.account, stream).await?;
        Ok(stream.delete_message(sequence).await?)
    }

    pub async fn get_message(&self, stream: &str, query: &MessageQuery) -> Result<StoredMessage> {
        Ok(self
            .shared
            .registry
            .get_message(&self.account, stream, query)
            .await?)
    }

    /// Read a message through the direct-get path (`allow_direct`).
    pub async fn direct_get(&self, stream: &str, query: &MessageQuery) -> Result<StoredMessage> {
        let stream = self.shared.registry.get(&self.account, stream).await?;
        Ok(stream.direct_get(query).await?)
    }

    // ========================================================================
    // Publish
    // ========================================================================

    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<PubAck> {
        self.publish_with_headers(subject, Headers::new(), payload).await
    }

    pub async fn publish_with_headers(
        &self,
        subject: &str,
        headers: Headers,
        payload: impl Into<Bytes>,
    ) -> Result<PubAck> {
        let subject = Subject::new(subject).map_err(StreamError::from)?;
        let message = Message::new(subject, payload).with_headers(headers);
        Ok(self.shared.registry.publish(&self.account, message).await?)
    }

    // ========================================================================
    // Sources
    // ========================================================================

    /// Add a source to one of this account's streams.
    pub async fn add_source(&self, stream: &str, source: &SourceConfig) -> Result<BindingId> {
        let spec = BindingSpec::from_source(StreamKey::new(self.account.clone(), stream), source)?;
        Ok(self.shared.add_binding(spec).await?)
    }

    pub async fn remove_source(&self, id: BindingId) -> Result<()> {
        self.owned(id).await?;
        Ok(self.shared.remove_binding(id).await?)
    }

    pub async fn pause_source(&self, id: BindingId) -> Result<()> {
        self.owned(id).await?;
        let bindings = self.shared.bindings.lock().await;
        bindings.consumer(id)?.pause();
        Ok(())
    }

    pub async fn resume_source(&self, id: BindingId) -> Result<()> {
        self.owned(id).await?;
        let bindings = self.shared.bindings.lock().await;
        bindings.consumer(id)?.resume();
        Ok(())
    }

    pub async fn source_status(&self, id: BindingId) -> Result<BindingStatus> {
        self.owned(id).await?;
        self.shared.binding_status(id).await
    }

    /// Bindings of other accounts are invisible.
    async fn owned(&self, id: BindingId) -> Result<()> {
        match self.shared.binding_downstream(id).await {
            Some(key) if key.account == self.account => Ok(()),
            _ => Err(BindingError::NotFound(id).into()),
        }
    }

    // ========================================================================
    // Exports
    // ========================================================================

    /// Export one of this account's streams; an empty `to` admits any account.
    pub async fn export_stream(
        &self,
        stream: &str,
        filter: Option<&str>,
        to: &[&str],
    ) -> Result<ExternalApiAddress> {
        let to: Vec<AccountId> = to.iter().copied().map(AccountId::from).collect();
        let address = self
            .shared
            .bridge
            .export_stream(&self.account, stream, filter, &to)
            .await?;
        debug!(account = %self.account, stream, address = %address, "Stream exported");
        Ok(address)
    }

    /// Open another account's exported stream.
    pub async fn resolve_external(&self, address: &str, stream: &str) -> Result<ExportedStream> {
        let address = ExternalApiAddress::parse(address)?;
        Ok(self
            .shared
            .bridge
            .resolve_external(&self.account, &address, stream)
            .await?)
    }
}
