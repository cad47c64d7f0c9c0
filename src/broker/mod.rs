//! Broker: the context object that owns every component.
//!
//! A [`Broker`] holds the account table, the stream registry, the bridge,
//! the binding table and the running sourcing consumers. It is built with
//! [`BrokerBuilder`] and torn down with [`Broker::shutdown`]; clients talk
//! to it through an authenticated [`Connection`].

mod client;

pub use client::Connection;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::account::{AccountId, AccountTable};
use crate::binding::{
    BindingError, BindingGraph, BindingId, BindingSpec, StreamKey, UpstreamRef,
};
use crate::bridge::{Bridge, BridgeError, ExportedStream, ExternalApiAddress};
use crate::config::{limit, Config, StreamConfig};
use crate::error::{ErrorKind, Result};
use crate::registry::{Stream, StreamError, StreamInfo, StreamRegistry};
use crate::sourcing::{BindingStatus, ConsumerHandle, SourcingConsumer};
use crate::storage::{init_storage, Storage};

/// Builder for a [`Broker`].
///
/// # Example
///
/// ```ignore
/// let broker = BrokerBuilder::new(Config::load(None)?)
///     .with_storage(Storage::memory())
///     .start()
///     .await?;
/// ```
pub struct BrokerBuilder {
    config: Config,
    storage: Option<Storage>,
}

impl BrokerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            storage: None,
        }
    }

    /// Use `storage` instead of opening the configured store directory.
    pub fn with_storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Open storage, restore durable streams and start their bindings.
    pub async fn start(self) -> Result<Broker> {
        self.config.validate()?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => init_storage(&self.config.server).await?,
        };
        let accounts = Arc::new(AccountTable::from_config(&self.config.accounts));
        let registry = Arc::new(StreamRegistry::new(
            accounts.clone(),
            storage.clone(),
            self.config.sourcing.channel_capacity,
        ));
        let bridge = Bridge::new(registry.clone(), accounts.clone())?;

        let broker = Broker {
            shared: Arc::new(Shared {
                config: self.config,
                accounts,
                registry,
                bridge,
                storage,
                bindings: Mutex::new(Bindings::default()),
            }),
        };
        broker.shared.restore().await?;

        info!(
            url = %broker.client_url(),
            accounts = broker.shared.accounts.ids().count(),
            durable = broker.shared.storage.is_durable(),
            "Broker started"
        );
        Ok(broker)
    }
}

/// A running broker.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    /// Start a broker with the configured storage.
    pub async fn start(config: Config) -> Result<Self> {
        BrokerBuilder::new(config).start().await
    }

    pub fn builder(config: Config) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Address clients would connect to.
    pub fn client_url(&self) -> String {
        self.shared.config.server.client_url()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.shared.registry
    }

    pub fn bridge(&self) -> &Bridge {
        &self.shared.bridge
    }

    /// Authenticate and bind a connection to the user's account.
    pub fn connect(&self, user: &str, password: &str) -> Result<Connection> {
        let account = self.shared.accounts.authenticate(user, password)?;
        debug!(user, account = %account, "Client connected");
        Ok(Connection::new(self.shared.clone(), account))
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Create a stream and one binding per `sources` entry.
    pub async fn add_stream(&self, account: &AccountId, config: StreamConfig) -> Result<StreamInfo> {
        self.shared.add_stream(account, config).await
    }

    /// Delete a stream, tearing down every binding into or out of it.
    pub async fn delete_stream(&self, account: &AccountId, stream: &str) -> Result<()> {
        self.shared.delete_stream(account, stream).await
    }

    // ========================================================================
    // Bindings
    // ========================================================================

    pub async fn add_binding(&self, spec: BindingSpec) -> Result<BindingId> {
        Ok(self.shared.add_binding(spec).await?)
    }

    /// Stop a binding and discard its cursor.
    pub async fn remove_binding(&self, id: BindingId) -> Result<()> {
        Ok(self.shared.remove_binding(id).await?)
    }

    pub async fn pause_binding(&self, id: BindingId) -> Result<()> {
        let bindings = self.shared.bindings.lock().await;
        bindings.consumer(id)?.pause();
        Ok(())
    }

    pub async fn resume_binding(&self, id: BindingId) -> Result<()> {
        let bindings = self.shared.bindings.lock().await;
        bindings.consumer(id)?.resume();
        Ok(())
    }

    pub async fn binding_status(&self, id: BindingId) -> Result<BindingStatus> {
        self.shared.binding_status(id).await
    }

    /// Every binding with its definition, ordered by id.
    pub async fn bindings(&self) -> Vec<(BindingId, BindingSpec)> {
        let bindings = self.shared.bindings.lock().await;
        let mut all: Vec<_> = bindings
            .entries
            .iter()
            .map(|(id, entry)| (*id, entry.spec.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    // ========================================================================
    // Exports
    // ========================================================================

    pub async fn export_stream(
        &self,
        account: &AccountId,
        stream: &str,
        filter: Option<&str>,
        to: &[AccountId],
    ) -> Result<ExternalApiAddress> {
        Ok(self
            .shared
            .bridge
            .export_stream(account, stream, filter, to)
            .await?)
    }

    pub async fn resolve_external(
        &self,
        importer: &AccountId,
        address: &ExternalApiAddress,
        stream: &str,
    ) -> Result<ExportedStream> {
        Ok(self
            .shared
            .bridge
            .resolve_external(importer, address, stream)
            .await?)
    }

    /// Make `address` unreachable until [`Broker::reconnect`].
    pub async fn disconnect(&self, address: &ExternalApiAddress) {
        self.shared.bridge.disconnect(address).await;
    }

    pub async fn reconnect(&self, address: &ExternalApiAddress) {
        self.shared.bridge.reconnect(address).await;
    }

    /// Stop every consumer, wait for them to drain, then close storage.
    ///
    /// Cursors are kept, so a broker restarted on the same store resumes.
    pub async fn shutdown(self) {
        let entries: Vec<BindingEntry> = {
            let mut bindings = self.shared.bindings.lock().await;
            bindings.graph = BindingGraph::new();
            bindings.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        join_all(entries.into_iter().map(|entry| entry.consumer.stop())).await;
        self.shared.storage.close().await;
        info!(bindings = count, "Broker stopped");
    }
}

struct BindingEntry {
    spec: BindingSpec,
    consumer: ConsumerHandle,
}

#[derive(Default)]
struct Bindings {
    graph: BindingGraph,
    entries: HashMap<BindingId, BindingEntry>,
}

impl Bindings {
    fn consumer(&self, id: BindingId) -> std::result::Result<&ConsumerHandle, BindingError> {
        self.entries
            .get(&id)
            .map(|entry| &entry.consumer)
            .ok_or(BindingError::NotFound(id))
    }

    fn take(&mut self, id: BindingId) -> Option<BindingEntry> {
        self.graph.remove(&id);
        self.entries.remove(&id)
    }
}

pub(crate) struct Shared {
    config: Config,
    accounts: Arc<AccountTable>,
    registry: Arc<StreamRegistry>,
    bridge: Bridge,
    storage: Storage,
    /// Serializes binding changes so validation and insertion are atomic.
    bindings: Mutex<Bindings>,
}

impl Shared {
    /// Recreate file streams from the catalog, then their bindings.
    async fn restore(&self) -> Result<()> {
        let recorded = self.storage.catalog().load().await?;
        if recorded.is_empty() {
            return Ok(());
        }

        let mut restored = Vec::with_capacity(recorded.len());
        for (account, config) in recorded {
            let account = AccountId::new(account);
            let name = config.name.clone();
            match self.registry.restore_stream(&account, config).await {
                Ok(stream) => restored.push(stream),
                Err(e) => {
                    error!(account = %account, stream = %name, error = %e, "Failed to restore stream");
                }
            }
        }

        // Upstreams of every binding exist once all streams are back.
        for stream in &restored {
            let key = StreamKey::new(stream.account().clone(), stream.name());
            for source in &stream.config().sources {
                let spec = match BindingSpec::from_source(key.clone(), source) {
                    Ok(spec) => spec,
                    Err(e) => {
                        warn!(stream = %key, source = %source.name, error = %e, "Invalid source definition");
                        continue;
                    }
                };
                let id = spec.id();
                match self.add_binding(spec).await {
                    Ok(_) | Err(BindingError::DuplicateBinding(_)) => {}
                    Err(e) => {
                        warn!(stream = %key, source = %source.name, error = %e, "Failed to restore source binding");
                        // The next binding with this id must not resume from it.
                        self.discard_cursor(id).await;
                    }
                }
            }
        }

        info!(streams = restored.len(), "Durable streams restored");
        Ok(())
    }

    async fn add_stream(&self, account: &AccountId, config: StreamConfig) -> Result<StreamInfo> {
        let key = StreamKey::new(account.clone(), config.name.clone());
        let specs = config
            .sources
            .iter()
            .map(|source| BindingSpec::from_source(key.clone(), source))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let stream = self.registry.create_stream(account, config).await?;

        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.add_binding(spec).await {
                Ok(id) => created.push(id),
                Err(e) => {
                    warn!(stream = %key, error = %e, "Source binding rejected, rolling back stream");
                    for id in created {
                        if let Err(e) = self.remove_binding(id).await {
                            warn!(binding = %id, error = %e, "Rollback of binding failed");
                        }
                    }
                    if let Err(e) = self.registry.delete_stream(account, &key.stream).await {
                        warn!(stream = %key, error = %e, "Rollback of stream failed");
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(stream.info().await?)
    }

    async fn delete_stream(&self, account: &AccountId, stream: &str) -> Result<()> {
        // Fail before touching bindings if the stream is unknown.
        self.registry.get(account, stream).await?;

        let key = StreamKey::new(account.clone(), stream);
        let torn_down: Vec<BindingEntry> = {
            let mut bindings = self.bindings.lock().await;
            bindings
                .graph
                .touching(&key)
                .into_iter()
                .filter_map(|id| bindings.take(id))
                .collect()
        };
        for entry in torn_down {
            let id = entry.consumer.id();
            entry.consumer.stop().await;
            self.discard_cursor(id).await;
            info!(binding = %id, stream = %key, "Binding removed with stream");
        }

        self.registry.delete_stream(account, stream).await?;
        Ok(())
    }

    async fn add_binding(&self, spec: BindingSpec) -> std::result::Result<BindingId, BindingError> {
        let id = spec.id();
        let upstream_key = spec.upstream_key();
        let mut bindings = self.bindings.lock().await;

        let downstream = self
            .registry
            .get(&spec.downstream.account, &spec.downstream.stream)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => BindingError::DownstreamNotFound(spec.downstream.to_string()),
                _ => BindingError::Stream(e),
            })?;

        if bindings.graph.contains(&id) {
            return Err(BindingError::DuplicateBinding(format!(
                "{} <- {}",
                spec.downstream, spec.upstream
            )));
        }
        if let Ok(account) = self.accounts.get(&spec.downstream.account) {
            if let Some(max) = limit(account.limits.max_consumers) {
                if bindings.graph.owned_by(&spec.downstream.account) as u64 >= max {
                    return Err(BindingError::LimitExceeded {
                        account: spec.downstream.account.to_string(),
                        max,
                    });
                }
            }
        }
        if let Some(cycle) = bindings.graph.cycle_through(&spec.downstream, &upstream_key) {
            let path: Vec<String> = cycle.iter().map(StreamKey::to_string).collect();
            return Err(BindingError::CircularSourcing(path.join(" -> ")));
        }
        check_downstream(&downstream)?;

        let handle = self.resolve_upstream(&spec).await?;
        let consumer = handle
            .create_consumer(spec.filter.clone(), spec.deliver.clone())
            .await
            .map_err(|e| match e {
                BridgeError::Stream(StreamError::ConsumerConflict(stream)) => {
                    BindingError::IncompatibleRetention {
                        stream,
                        reason: "workqueue retention admits a single consumer".to_string(),
                    }
                }
                other => BindingError::Bridge(other),
            })?;

        if let Err(e) = bindings
            .graph
            .insert(id, spec.downstream.clone(), upstream_key.clone())
        {
            consumer.close().await;
            return Err(e);
        }

        let handle = SourcingConsumer::spawn(
            id,
            consumer,
            downstream,
            self.storage.cursors(),
            self.config.sourcing.clone(),
        );
        info!(
            binding = %id,
            downstream = %spec.downstream,
            upstream = %spec.upstream,
            filter = spec.filter.as_ref().map(|f| f.as_str()).unwrap_or(">"),
            deliver = spec.deliver.as_deref().unwrap_or(""),
            "Source binding added"
        );
        bindings.entries.insert(
            id,
            BindingEntry {
                spec,
                consumer: handle,
            },
        );
        Ok(id)
    }

    async fn resolve_upstream(
        &self,
        spec: &BindingSpec,
    ) -> std::result::Result<ExportedStream, BindingError> {
        let resolved = match &spec.upstream {
            UpstreamRef::Local { stream } => {
                self.bridge.local(&spec.downstream.account, stream).await
            }
            UpstreamRef::External { address, stream } => {
                self.bridge
                    .resolve_external(&spec.downstream.account, address, stream)
                    .await
            }
        };
        resolved.map_err(|e| match e {
            BridgeError::Stream(inner) if inner.kind() == ErrorKind::NotFound => {
                BindingError::UpstreamNotFound(spec.upstream_key().to_string())
            }
            other => BindingError::Bridge(other),
        })
    }

    async fn remove_binding(&self, id: BindingId) -> std::result::Result<(), BindingError> {
        let entry = self
            .bindings
            .lock()
            .await
            .take(id)
            .ok_or(BindingError::NotFound(id))?;
        entry.consumer.stop().await;
        self.discard_cursor(id).await;
        info!(binding = %id, downstream = %entry.spec.downstream, "Source binding removed");
        Ok(())
    }

    async fn binding_status(&self, id: BindingId) -> Result<BindingStatus> {
        let bindings = self.bindings.lock().await;
        Ok(bindings.consumer(id)?.status())
    }

    /// Downstream of a binding, if it exists.
    async fn binding_downstream(&self, id: BindingId) -> Option<StreamKey> {
        let bindings = self.bindings.lock().await;
        bindings.entries.get(&id).map(|entry| entry.spec.downstream.clone())
    }

    async fn discard_cursor(&self, id: BindingId) {
        if let Err(e) = self.storage.cursors().delete(&id.cursor_key()).await {
            warn!(binding = %id, error = %e, "Failed to delete cursor");
        }
    }
}

/// A sealed stream accepts no appends, sourced or not.
fn check_downstream(downstream: &Stream) -> std::result::Result<(), BindingError> {
    if downstream.config().sealed {
        return Err(BindingError::IncompatibleRetention {
            stream: downstream.name().to_string(),
            reason: "downstream is sealed".to_string(),
        });
    }
    Ok(())
}
