//! SQLite MessageStore implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::message::{Headers, StoredMessage};
use crate::storage::schema::{Messages, StreamMeta};
use crate::storage::{MessageStore, Result, StorageError, StoreState};

/// SQLite implementation of MessageStore, scoped to one stream.
pub struct SqliteMessageStore {
    pool: SqlitePool,
    account: String,
    stream: String,
}

impl SqliteMessageStore {
    /// Create a store for `account`/`stream` on a shared pool.
    pub fn new(pool: SqlitePool, account: &str, stream: &str) -> Self {
        Self {
            pool,
            account: account.to_string(),
            stream: stream.to_string(),
        }
    }

    async fn insert(&self, conn: &mut SqliteConnection, message: &StoredMessage) -> Result<()> {
        let headers = serde_json::to_string(&message.headers)?;

        let query = Query::insert()
            .into_table(Messages::Table)
            .columns([
                Messages::Account,
                Messages::Stream,
                Messages::Sequence,
                Messages::Subject,
                Messages::Payload,
                Messages::Headers,
                Messages::Size,
                Messages::CreatedAt,
            ])
            .values_panic([
                self.account.as_str().into(),
                self.stream.as_str().into(),
                message.sequence.into(),
                message.subject.as_str().into(),
                message.payload.to_vec().into(),
                headers.into(),
                message.size().into(),
                message.timestamp.to_rfc3339().into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;

        let query = Query::insert()
            .into_table(StreamMeta::Table)
            .columns([StreamMeta::Account, StreamMeta::Stream, StreamMeta::LastSeq])
            .values_panic([
                self.account.as_str().into(),
                self.stream.as_str().into(),
                message.sequence.into(),
            ])
            .on_conflict(
                OnConflict::columns([StreamMeta::Account, StreamMeta::Stream])
                    .update_column(StreamMeta::LastSeq)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&mut *conn).await?;

        Ok(())
    }

    fn select(&self) -> sea_query::SelectStatement {
        Query::select()
            .columns([
                Messages::Sequence,
                Messages::Subject,
                Messages::Payload,
                Messages::Headers,
                Messages::CreatedAt,
            ])
            .from(Messages::Table)
            .and_where(Expr::col(Messages::Account).eq(self.account.as_str()))
            .and_where(Expr::col(Messages::Stream).eq(self.stream.as_str()))
            .to_owned()
    }

    async fn last_seq(&self) -> Result<u64> {
        let query = Query::select()
            .column(StreamMeta::LastSeq)
            .from(StreamMeta::Table)
            .and_where(Expr::col(StreamMeta::Account).eq(self.account.as_str()))
            .and_where(Expr::col(StreamMeta::Stream).eq(self.stream.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.get::<i64, _>("last_seq") as u64).unwrap_or(0))
    }
}

fn decode_row(row: &SqliteRow) -> Result<StoredMessage> {
    let sequence: i64 = row.get("sequence");
    let payload: Vec<u8> = row.get("payload");
    let headers: String = row.get("headers");
    let created_at: String = row.get("created_at");

    let timestamp = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| StorageError::Corrupt(format!("created_at '{created_at}': {e}")))?
        .with_timezone(&Utc);

    Ok(StoredMessage {
        sequence: sequence as u64,
        subject: row.get("subject"),
        payload: Bytes::from(payload),
        headers: serde_json::from_str::<Headers>(&headers)?,
        timestamp,
    })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn append(&self, message: &StoredMessage) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match self.insert(&mut conn, message).await {
            Ok(()) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(())
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn get(&self, sequence: u64) -> Result<Option<StoredMessage>> {
        let query = self
            .select()
            .and_where(Expr::col(Messages::Sequence).eq(sequence))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn range(&self, from: u64, limit: usize) -> Result<Vec<StoredMessage>> {
        let query = self
            .select()
            .and_where(Expr::col(Messages::Sequence).gte(from))
            .order_by(Messages::Sequence, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn last_for_subject(&self, subject: &str) -> Result<Option<StoredMessage>> {
        let query = self
            .select()
            .and_where(Expr::col(Messages::Subject).eq(subject))
            .order_by(Messages::Sequence, Order::Desc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn sequences_for_subject(&self, subject: &str) -> Result<Vec<u64>> {
        let query = Query::select()
            .column(Messages::Sequence)
            .from(Messages::Table)
            .and_where(Expr::col(Messages::Account).eq(self.account.as_str()))
            .and_where(Expr::col(Messages::Stream).eq(self.stream.as_str()))
            .and_where(Expr::col(Messages::Subject).eq(subject))
            .order_by(Messages::Sequence, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|r| r.get::<i64, _>("sequence") as u64)
            .collect())
    }

    async fn remove(&self, sequence: u64) -> Result<Option<u64>> {
        let query = Query::delete()
            .from_table(Messages::Table)
            .and_where(Expr::col(Messages::Account).eq(self.account.as_str()))
            .and_where(Expr::col(Messages::Stream).eq(self.stream.as_str()))
            .and_where(Expr::col(Messages::Sequence).eq(sequence))
            .returning_col(Messages::Size)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.get::<i64, _>("size") as u64))
    }

    async fn purge(&self) -> Result<u64> {
        let query = Query::delete()
            .from_table(Messages::Table)
            .and_where(Expr::col(Messages::Account).eq(self.account.as_str()))
            .and_where(Expr::col(Messages::Stream).eq(self.stream.as_str()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn state(&self) -> Result<StoreState> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS messages, COALESCE(SUM(size), 0) AS bytes, \
             MIN(sequence) AS first_seq, COUNT(DISTINCT subject) AS num_subjects \
             FROM messages WHERE account = ? AND stream = ?",
        )
        .bind(&self.account)
        .bind(&self.stream)
        .fetch_one(&self.pool)
        .await?;

        let last_seq = self.last_seq().await?;
        let first_seq = match row.get::<Option<i64>, _>("first_seq") {
            Some(seq) => seq as u64,
            None if last_seq == 0 => 0,
            None => last_seq + 1,
        };

        Ok(StoreState {
            messages: row.get::<i64, _>("messages") as u64,
            bytes: row.get::<i64, _>("bytes") as u64,
            first_seq,
            last_seq,
            num_subjects: row.get::<i64, _>("num_subjects") as u64,
        })
    }

    async fn destroy(&self) -> Result<()> {
        self.purge().await?;

        let query = Query::delete()
            .from_table(StreamMeta::Table)
            .and_where(Expr::col(StreamMeta::Account).eq(self.account.as_str()))
            .and_where(Expr::col(StreamMeta::Stream).eq(self.stream.as_str()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&query).execute(&self.pool).await?;

        Ok(())
    }
}
