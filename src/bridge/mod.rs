//! Cross-account bridge.
//!
//! An account exposes selected streams through its external API address
//! (`$JS.<account>.API`). Importers resolve an address into an
//! [`ExportedStream`] capability: a typed handle that carries the
//! read-only operation set and the export filter, and is the only way one
//! account can see another account's messages.

mod handle;

pub use handle::{Delivery, ExportedStream, Fetched, Link, ScopedConsumer};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::account::{AccountId, AccountTable, AuthError};
use crate::error::ErrorKind;
use crate::registry::{StreamError, StreamRegistry};
use crate::subject::{SubjectError, SubjectFilter};

const API_ADDRESS_PREFIX: &str = "$JS.";
const API_ADDRESS_SUFFIX: &str = ".API";

/// Cross-account bridge errors.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Account {importer} is not authorized to import from {address}")]
    Unauthorized { importer: String, address: String },

    #[error("Stream {stream} is not exported through {address}")]
    NotExported { address: String, stream: String },

    #[error("{op} is not permitted on exported stream {stream}")]
    PermissionDenied { op: ApiOperation, stream: String },

    #[error("External API {0} is unreachable")]
    Disconnected(String),

    #[error("Invalid external API address '{0}'")]
    InvalidAddress(String),

    #[error("No account behind external API {0}")]
    UnknownAddress(String),

    #[error("Invalid export filter: {0}")]
    Filter(#[from] SubjectError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Unauthorized { .. }
            | BridgeError::NotExported { .. }
            | BridgeError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            BridgeError::Disconnected(_) => ErrorKind::TransientUpstreamUnavailable,
            BridgeError::InvalidAddress(_) | BridgeError::Filter(_) => ErrorKind::InvalidRequest,
            BridgeError::UnknownAddress(_) => ErrorKind::NotFound,
            BridgeError::Auth(e) => e.kind(),
            BridgeError::Stream(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// An account's external API address, `$JS.<account>.API`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalApiAddress(String);

impl ExternalApiAddress {
    pub fn for_account(account: &AccountId) -> Self {
        Self(format!("{API_ADDRESS_PREFIX}{account}{API_ADDRESS_SUFFIX}"))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let account = raw
            .strip_prefix(API_ADDRESS_PREFIX)
            .and_then(|rest| rest.strip_suffix(API_ADDRESS_SUFFIX))
            .filter(|account| !account.is_empty() && !account.contains(['.', '*', '>', ' ']))
            .ok_or_else(|| BridgeError::InvalidAddress(raw.to_string()))?;
        Ok(Self::for_account(&AccountId::from(account)))
    }

    /// The exporting account.
    pub fn account(&self) -> AccountId {
        let inner = &self.0[API_ADDRESS_PREFIX.len()..self.0.len() - API_ADDRESS_SUFFIX.len()];
        AccountId::from(inner)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalApiAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations of the stream API, as seen through a bridge handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    Info,
    CreateConsumer,
    Fetch,
    Ack,
    Subscribe,
    Publish,
    Delete,
    List,
}

impl ApiOperation {
    /// What an exported stream allows: reading and consuming.
    pub const READ_ONLY: &'static [ApiOperation] = &[
        ApiOperation::Info,
        ApiOperation::CreateConsumer,
        ApiOperation::Fetch,
        ApiOperation::Ack,
        ApiOperation::Subscribe,
    ];
}

impl fmt::Display for ApiOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiOperation::Info => "STREAM.INFO",
            ApiOperation::CreateConsumer => "CONSUMER.CREATE",
            ApiOperation::Fetch => "CONSUMER.MSG.NEXT",
            ApiOperation::Ack => "ACK",
            ApiOperation::Subscribe => "SUBSCRIBE",
            ApiOperation::Publish => "PUBLISH",
            ApiOperation::Delete => "STREAM.DELETE",
            ApiOperation::List => "STREAM.LIST",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct Export {
    filter: SubjectFilter,
    /// Importers allowed in; empty admits any account.
    to: Vec<AccountId>,
}

impl Export {
    fn admits(&self, importer: &AccountId) -> bool {
        self.to.is_empty() || self.to.contains(importer)
    }
}

/// Export table and address reachability.
pub struct Bridge {
    registry: Arc<StreamRegistry>,
    accounts: Arc<AccountTable>,
    /// (exporting account, stream) -> export.
    exports: RwLock<HashMap<(AccountId, String), Export>>,
    links: RwLock<HashMap<AccountId, Arc<Link>>>,
}

impl Bridge {
    /// Build with the exports declared in account configuration.
    ///
    /// Declared exports may name streams that do not exist yet.
    pub fn new(registry: Arc<StreamRegistry>, accounts: Arc<AccountTable>) -> Result<Self> {
        let mut exports = HashMap::new();
        let mut links = HashMap::new();

        for id in accounts.ids() {
            let account = accounts.get(id)?;
            for declared in &account.exports {
                let filter = match declared.filter.as_deref() {
                    Some(raw) => SubjectFilter::new(raw)?,
                    None => SubjectFilter::all(),
                };
                exports.insert(
                    (id.clone(), declared.stream.clone()),
                    Export {
                        filter,
                        to: declared.to.iter().map(|a| AccountId::from(a.as_str())).collect(),
                    },
                );
            }
            links.insert(id.clone(), Arc::new(Link::new()));
        }

        Ok(Self {
            registry,
            accounts,
            exports: RwLock::new(exports),
            links: RwLock::new(links),
        })
    }

    /// Expose `stream` through the account's external API address.
    ///
    /// `to` lists the accounts allowed to import; empty admits any account.
    /// Exporting the same stream again replaces the earlier export.
    pub async fn export_stream(
        &self,
        account: &AccountId,
        stream: &str,
        filter: Option<&str>,
        to: &[AccountId],
    ) -> Result<ExternalApiAddress> {
        self.registry.get(account, stream).await?;
        let filter = match filter {
            Some(raw) => SubjectFilter::new(raw)?,
            None => SubjectFilter::all(),
        };
        let address = ExternalApiAddress::for_account(account);

        info!(
            account = %account,
            stream = %stream,
            filter = %filter,
            to = ?to,
            address = %address,
            "Stream exported"
        );
        self.exports.write().await.insert(
            (account.clone(), stream.to_string()),
            Export {
                filter,
                to: to.to_vec(),
            },
        );
        Ok(address)
    }

    /// Resolve an address into a read-only handle on one exported stream.
    pub async fn resolve_external(
        &self,
        importer: &AccountId,
        address: &ExternalApiAddress,
        stream: &str,
    ) -> Result<ExportedStream> {
        let exporter = address.account();
        if !self.accounts.contains(&exporter) {
            return Err(BridgeError::UnknownAddress(address.to_string()));
        }
        let link = self.link(&exporter).await;
        link.check(address)?;

        let export = self
            .exports
            .read()
            .await
            .get(&(exporter.clone(), stream.to_string()))
            .cloned()
            .ok_or_else(|| BridgeError::NotExported {
                address: address.to_string(),
                stream: stream.to_string(),
            })?;
        if !export.admits(importer) {
            warn!(importer = %importer, address = %address, stream = %stream, "Import refused");
            return Err(BridgeError::Unauthorized {
                importer: importer.to_string(),
                address: address.to_string(),
            });
        }

        let upstream = self.registry.get(&exporter, stream).await?;
        Ok(ExportedStream::external(
            upstream,
            address.clone(),
            export.filter,
            link,
        ))
    }

    /// Handle on a stream of the importer's own account.
    ///
    /// Same read-only operation set, no export filter, never disconnected.
    pub async fn local(&self, account: &AccountId, stream: &str) -> Result<ExportedStream> {
        let upstream = self.registry.get(account, stream).await?;
        Ok(ExportedStream::local(upstream))
    }

    /// Make an address unreachable. Handles resolved through it fail with
    /// `TransientUpstreamUnavailable` until [`Bridge::reconnect`].
    pub async fn disconnect(&self, address: &ExternalApiAddress) {
        self.link(&address.account()).await.set_connected(false);
        warn!(address = %address, "External API disconnected");
    }

    pub async fn reconnect(&self, address: &ExternalApiAddress) {
        self.link(&address.account()).await.set_connected(true);
        info!(address = %address, "External API reconnected");
    }

    async fn link(&self, account: &AccountId) -> Arc<Link> {
        if let Some(link) = self.links.read().await.get(account) {
            return link.clone();
        }
        self.links
            .write()
            .await
            .entry(account.clone())
            .or_insert_with(|| Arc::new(Link::new()))
            .clone()
    }
}
