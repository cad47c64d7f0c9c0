//! SQLite CursorStore implementation.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::storage::schema::Cursors;
use crate::storage::{CursorStore, Result};

/// SQLite implementation of CursorStore.
pub struct SqliteCursorStore {
    pool: SqlitePool,
}

impl SqliteCursorStore {
    /// Create a new SQLite cursor store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    async fn get(&self, binding: &str) -> Result<Option<u64>> {
        let query = Query::select()
            .column(Cursors::Sequence)
            .from(Cursors::Table)
            .and_where(Expr::col(Cursors::Binding).eq(binding))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => {
                let sequence: i64 = row.get("sequence");
                Ok(Some(sequence as u64))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, binding: &str, sequence: u64) -> Result<()> {
        let updated_at = chrono::Utc::now().to_rfc3339();

        let query = Query::insert()
            .into_table(Cursors::Table)
            .columns([Cursors::Binding, Cursors::Sequence, Cursors::UpdatedAt])
            .values_panic([binding.into(), sequence.into(), updated_at.into()])
            .on_conflict(
                OnConflict::column(Cursors::Binding)
                    .update_columns([Cursors::Sequence, Cursors::UpdatedAt])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;

        Ok(())
    }

    async fn delete(&self, binding: &str) -> Result<()> {
        let query = Query::delete()
            .from_table(Cursors::Table)
            .and_where(Expr::col(Cursors::Binding).eq(binding))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;

        Ok(())
    }
}
