//! SQLite implementations of storage interfaces.
//!
//! One database file holds every durable stream of the broker, the stream
//! catalog and the sourcing cursors.

mod catalog;
mod cursor_store;
mod message_store;

pub use catalog::SqliteCatalog;
pub use cursor_store::SqliteCursorStore;
pub use message_store::SqliteMessageStore;

use sqlx::SqlitePool;

use super::schema::{
    CREATE_CURSORS_TABLE, CREATE_MESSAGES_TABLE, CREATE_STREAMS_TABLE, CREATE_STREAM_META_TABLE,
};
use super::Result;

/// Create every table if missing.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(CREATE_MESSAGES_TABLE).execute(pool).await?;
    sqlx::query(CREATE_STREAM_META_TABLE).execute(pool).await?;
    sqlx::query(CREATE_STREAMS_TABLE).execute(pool).await?;
    sqlx::query(CREATE_CURSORS_TABLE).execute(pool).await?;
    Ok(())
}
