//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Messages table schema.
#[derive(Iden)]
pub enum Messages {
    Table,
    #[iden = "account"]
    Account,
    #[iden = "stream"]
    Stream,
    #[iden = "sequence"]
    Sequence,
    #[iden = "subject"]
    Subject,
    #[iden = "payload"]
    Payload,
    #[iden = "headers"]
    Headers,
    #[iden = "size"]
    Size,
    #[iden = "created_at"]
    CreatedAt,
}

/// Per-stream sequence high-water marks.
#[derive(Iden)]
pub enum StreamMeta {
    Table,
    #[iden = "account"]
    Account,
    #[iden = "stream"]
    Stream,
    #[iden = "last_seq"]
    LastSeq,
}

/// Durable stream definitions.
#[derive(Iden)]
pub enum Streams {
    Table,
    #[iden = "account"]
    Account,
    #[iden = "name"]
    Name,
    #[iden = "config"]
    Config,
    #[iden = "created_at"]
    CreatedAt,
}

/// Sourcing cursors table schema.
#[derive(Iden)]
pub enum Cursors {
    Table,
    #[iden = "binding"]
    Binding,
    #[iden = "sequence"]
    Sequence,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// SQL for creating the messages table.
pub const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    account TEXT NOT NULL,
    stream TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    subject TEXT NOT NULL,
    payload BLOB NOT NULL,
    headers TEXT NOT NULL,
    size INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (account, stream, sequence)
);

CREATE INDEX IF NOT EXISTS idx_messages_subject ON messages(account, stream, subject, sequence);
"#;

/// SQL for creating the stream metadata table.
pub const CREATE_STREAM_META_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stream_meta (
    account TEXT NOT NULL,
    stream TEXT NOT NULL,
    last_seq INTEGER NOT NULL,
    PRIMARY KEY (account, stream)
);
"#;

/// SQL for creating the stream catalog table.
pub const CREATE_STREAMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS streams (
    account TEXT NOT NULL,
    name TEXT NOT NULL,
    config TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (account, name)
);
"#;

/// SQL for creating the cursors table.
pub const CREATE_CURSORS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cursors (
    binding TEXT NOT NULL PRIMARY KEY,
    sequence INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
"#;
