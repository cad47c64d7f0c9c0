//! SQLite StreamCatalog implementation.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use crate::config::StreamConfig;
use crate::storage::schema::Streams;
use crate::storage::{Result, StreamCatalog};

/// Stream definitions stored as JSON rows.
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StreamCatalog for SqliteCatalog {
    async fn save(&self, account: &str, config: &StreamConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let created_at = chrono::Utc::now().to_rfc3339();

        let query = Query::insert()
            .into_table(Streams::Table)
            .columns([
                Streams::Account,
                Streams::Name,
                Streams::Config,
                Streams::CreatedAt,
            ])
            .values_panic([
                account.into(),
                config.name.as_str().into(),
                json.into(),
                created_at.into(),
            ])
            .on_conflict(
                OnConflict::columns([Streams::Account, Streams::Name])
                    .update_column(Streams::Config)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn remove(&self, account: &str, stream: &str) -> Result<()> {
        let query = Query::delete()
            .from_table(Streams::Table)
            .and_where(Expr::col(Streams::Account).eq(account))
            .and_where(Expr::col(Streams::Name).eq(stream))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn load(&self) -> Result<Vec<(String, StreamConfig)>> {
        let query = Query::select()
            .columns([Streams::Account, Streams::Config])
            .from(Streams::Table)
            .order_by(Streams::CreatedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let account: String = row.get("account");
                let config: String = row.get("config");
                Ok((account, serde_json::from_str(&config)?))
            })
            .collect()
    }
}
