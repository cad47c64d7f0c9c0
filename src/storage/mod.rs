//! Storage implementations.
//!
//! Streams keep their messages behind [`MessageStore`]; sourcing bindings
//! keep their cursors behind [`CursorStore`]; file-backed stream definitions
//! are kept in a [`StreamCatalog`] so a restarted broker recreates them.

use std::sync::Arc;

use tracing::info;

use crate::config::{ServerConfig, StorageType, StreamConfig};
use crate::error::ErrorKind;

mod cursor_store;
mod message_store;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use cursor_store::CursorStore;
pub use memory::{MemoryCatalog, MemoryCursorStore, MemoryMessageStore};
pub use message_store::{MessageStore, StoreState};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteCatalog, SqliteCursorStore, SqliteMessageStore};

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage type '{0}' requires a configured store directory")]
    NoStoreDir(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NoStoreDir(_) => ErrorKind::Configuration,
            _ => ErrorKind::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persisted definitions of durable streams.
#[async_trait::async_trait]
pub trait StreamCatalog: Send + Sync {
    /// Record (or replace) a stream definition.
    async fn save(&self, account: &str, config: &StreamConfig) -> Result<()>;

    /// Forget a stream definition.
    async fn remove(&self, account: &str, stream: &str) -> Result<()>;

    /// Every recorded definition as `(account, config)`, in creation order.
    async fn load(&self) -> Result<Vec<(String, StreamConfig)>>;
}

/// Storage backends shared by every stream and binding of one broker.
#[derive(Clone)]
pub struct Storage {
    catalog: Arc<dyn StreamCatalog>,
    cursors: Arc<dyn CursorStore>,
    #[cfg(feature = "sqlite")]
    pool: Option<sqlx::SqlitePool>,
}

impl Storage {
    /// Purely in-memory storage. `file` streams are rejected.
    pub fn memory() -> Self {
        Self {
            catalog: Arc::new(MemoryCatalog::new()),
            cursors: Arc::new(MemoryCursorStore::new()),
            #[cfg(feature = "sqlite")]
            pool: None,
        }
    }

    /// Replace the cursor store.
    pub fn with_cursor_store(mut self, cursors: Arc<dyn CursorStore>) -> Self {
        self.cursors = cursors;
        self
    }

    pub fn catalog(&self) -> Arc<dyn StreamCatalog> {
        self.catalog.clone()
    }

    pub fn cursors(&self) -> Arc<dyn CursorStore> {
        self.cursors.clone()
    }

    /// Open the message store for one stream.
    pub async fn message_store(
        &self,
        account: &str,
        stream: &str,
        storage: StorageType,
    ) -> Result<Arc<dyn MessageStore>> {
        match storage {
            StorageType::Memory => Ok(Arc::new(MemoryMessageStore::new())),
            #[cfg(feature = "sqlite")]
            StorageType::File => match &self.pool {
                Some(pool) => Ok(Arc::new(SqliteMessageStore::new(pool.clone(), account, stream))),
                None => Err(StorageError::NoStoreDir("file".to_string())),
            },
            #[cfg(not(feature = "sqlite"))]
            StorageType::File => {
                let _ = (account, stream);
                Err(StorageError::NoStoreDir("file".to_string()))
            }
        }
    }

    /// Whether `file` streams are supported.
    pub fn is_durable(&self) -> bool {
        #[cfg(feature = "sqlite")]
        {
            self.pool.is_some()
        }
        #[cfg(not(feature = "sqlite"))]
        {
            false
        }
    }

    /// Close any open database handles.
    pub async fn close(&self) {
        #[cfg(feature = "sqlite")]
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

/// Initialize storage based on configuration.
///
/// Without a `store_dir` everything lives in memory. With one, durable
/// state goes to `<store_dir>/sourcing.db`.
pub async fn init_storage(config: &ServerConfig) -> Result<Storage> {
    let Some(dir) = config.store_dir.as_deref() else {
        info!("Storage: memory");
        return Ok(Storage::memory());
    };

    #[cfg(feature = "sqlite")]
    {
        std::fs::create_dir_all(dir)?;
        let path = std::path::Path::new(dir).join("sourcing.db");
        info!("Storage: sqlite at {}", path.display());

        let pool =
            sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display())).await?;
        sqlite::init_schema(&pool).await?;

        Ok(Storage {
            catalog: Arc::new(SqliteCatalog::new(pool.clone())),
            cursors: Arc::new(SqliteCursorStore::new(pool.clone())),
            pool: Some(pool),
        })
    }

    #[cfg(not(feature = "sqlite"))]
    {
        tracing::error!(store_dir = %dir, "store_dir configured but 'sqlite' feature is not enabled");
        Err(StorageError::Unavailable("sqlite feature not enabled".to_string()))
    }
}
