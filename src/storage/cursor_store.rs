//! CursorStore trait definition.

use async_trait::async_trait;

use super::Result;

/// Interface for sourcing cursor tracking.
///
/// Tracks the last upstream sequence a source binding applied downstream.
/// Sourcing consumers resume from their cursor after a restart, so nothing
/// already applied is applied again and nothing unapplied is skipped.
///
/// # Key
///
/// Cursors are keyed by the binding id (see `BindingId`), which is
/// derived from the downstream stream, the upstream stream and the filter,
/// and is therefore stable across restarts.
///
/// # Implementations
///
/// - `SqliteCursorStore`: SQLite storage
/// - `MemoryCursorStore`: In-memory store, also used for fault injection in tests
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Get the last applied upstream sequence for a binding.
    ///
    /// Returns `None` if no cursor has been recorded.
    async fn get(&self, binding: &str) -> Result<Option<u64>>;

    /// Store the last applied upstream sequence for a binding.
    ///
    /// Upserts: creates the cursor if it doesn't exist, updates if it does.
    async fn put(&self, binding: &str, sequence: u64) -> Result<()>;

    /// Forget a binding's cursor.
    async fn delete(&self, binding: &str) -> Result<()>;
}
