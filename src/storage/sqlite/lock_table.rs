//! SQLite LockTable implementation.

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sqlx::{Row, SqlitePool};

use super::{decode_timestamp, decode_u64, encode_timestamp, encode_u64};
use crate::model::LockEntry;
use crate::storage::schema::{Locks, CREATE_LOCKS_TABLE};
use crate::storage::{LockTable, Result};

/// SQLite implementation of LockTable.
///
/// Conditional writes are single statements: an `INSERT .. ON CONFLICT DO
/// NOTHING` for new rows and an `UPDATE .. WHERE revision = ?` otherwise.
pub struct SqliteLockTable {
    pool: SqlitePool,
}

impl SqliteLockTable {
    /// Create a new SQLite lock table.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_LOCKS_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl LockTable for SqliteLockTable {
    async fn load(&self, state_key: &str) -> Result<Option<LockEntry>> {
        let query = Query::select()
            .columns([
                Locks::StateKey,
                Locks::HolderId,
                Locks::AcquiredAt,
                Locks::ExpiresAt,
                Locks::FencingToken,
                Locks::Revision,
            ])
            .from(Locks::Table)
            .and_where(Expr::col(Locks::StateKey).eq(state_key))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let acquired_at: Option<String> = row.get("acquired_at");
        let expires_at: Option<String> = row.get("expires_at");
        Ok(Some(LockEntry {
            state_key: row.get("state_key"),
            holder_id: row.get("holder_id"),
            acquired_at: acquired_at.as_deref().map(decode_timestamp).transpose()?,
            expires_at: expires_at.as_deref().map(decode_timestamp).transpose()?,
            fencing_token: decode_u64(row.get("fencing_token"))?,
            revision: decode_u64(row.get("revision"))?,
        }))
    }

    async fn put_if(&self, entry: LockEntry, expected_revision: Option<u64>) -> Result<bool> {
        let acquired_at = entry.acquired_at.map(encode_timestamp);
        let expires_at = entry.expires_at.map(encode_timestamp);
        let fencing_token = encode_u64(entry.fencing_token)?;
        let revision = encode_u64(entry.revision)?;

        let query = match expected_revision {
            None => Query::insert()
                .into_table(Locks::Table)
                .columns([
                    Locks::StateKey,
                    Locks::HolderId,
                    Locks::AcquiredAt,
                    Locks::ExpiresAt,
                    Locks::FencingToken,
                    Locks::Revision,
                ])
                .values_panic([
                    entry.state_key.into(),
                    entry.holder_id.into(),
                    acquired_at.into(),
                    expires_at.into(),
                    fencing_token.into(),
                    revision.into(),
                ])
                .on_conflict(OnConflict::column(Locks::StateKey).do_nothing().to_owned())
                .to_string(SqliteQueryBuilder),
            Some(expected) => Query::update()
                .table(Locks::Table)
                .values([
                    (Locks::HolderId, entry.holder_id.into()),
                    (Locks::AcquiredAt, acquired_at.into()),
                    (Locks::ExpiresAt, expires_at.into()),
                    (Locks::FencingToken, fencing_token.into()),
                    (Locks::Revision, revision.into()),
                ])
                .and_where(Expr::col(Locks::StateKey).eq(entry.state_key))
                .and_where(Expr::col(Locks::Revision).eq(encode_u64(expected)?))
                .to_string(SqliteQueryBuilder),
        };

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}
