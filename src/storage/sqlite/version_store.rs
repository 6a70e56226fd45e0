//! SQLite VersionStore implementation.

use async_trait::async_trait;
use sea_query::{Expr, Order, Query, SelectStatement, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use super::{decode_timestamp, decode_u64, encode_timestamp, encode_u64};
use crate::model::{VersionId, VersionMeta, VersionRecord};
use crate::storage::schema::{Versions, CREATE_VERSIONS_TABLE};
use crate::storage::{CommitPrecondition, Result, StorageError, VersionStore};

/// SQLite implementation of VersionStore.
pub struct SqliteVersionStore {
    pool: SqlitePool,
}

impl SqliteVersionStore {
    /// Create a new SQLite version store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_VERSIONS_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    fn meta_columns(query: &mut SelectStatement) -> &mut SelectStatement {
        query.columns([
            Versions::StateKey,
            Versions::VersionId,
            Versions::CreatedAt,
            Versions::ContentHash,
            Versions::EncryptionKeyId,
            Versions::FencingToken,
            Versions::Size,
        ])
    }

    fn meta_from_row(row: &SqliteRow) -> Result<VersionMeta> {
        let created_at: String = row.get("created_at");
        Ok(VersionMeta {
            state_key: row.get("state_key"),
            version_id: VersionId::new(decode_u64(row.get("version_id"))?),
            created_at: decode_timestamp(&created_at)?,
            content_hash: row.get("content_hash"),
            encryption_key_id: row.get("encryption_key_id"),
            fencing_token: decode_u64(row.get("fencing_token"))?,
            size: decode_u64(row.get("size"))?,
        })
    }

    async fn head_on(conn: &mut SqliteConnection, state_key: &str) -> Result<Option<VersionMeta>> {
        let query = Self::meta_columns(&mut Query::select())
            .from(Versions::Table)
            .and_where(Expr::col(Versions::StateKey).eq(state_key))
            .order_by(Versions::VersionId, Order::Desc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        row.as_ref().map(Self::meta_from_row).transpose()
    }

    /// Check the precondition and append within an already-started transaction.
    async fn append(
        conn: &mut SqliteConnection,
        record: VersionRecord,
        precondition: CommitPrecondition,
    ) -> Result<()> {
        let head = Self::head_on(conn, &record.meta.state_key).await?;
        if let Some(reason) = precondition.violation(head.as_ref(), record.meta.version_id) {
            return Err(StorageError::PreconditionFailed {
                state_key: record.meta.state_key,
                reason,
            });
        }

        let meta = record.meta;
        let query = Query::insert()
            .into_table(Versions::Table)
            .columns([
                Versions::StateKey,
                Versions::VersionId,
                Versions::CreatedAt,
                Versions::ContentHash,
                Versions::EncryptionKeyId,
                Versions::FencingToken,
                Versions::Size,
                Versions::Ciphertext,
            ])
            .values_panic([
                meta.state_key.clone().into(),
                encode_u64(meta.version_id.sequence())?.into(),
                encode_timestamp(meta.created_at).into(),
                meta.content_hash.into(),
                meta.encryption_key_id.into(),
                encode_u64(meta.fencing_token)?.into(),
                encode_u64(meta.size)?.into(),
                record.ciphertext.into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;
        debug!(state_key = %meta.state_key, version = %meta.version_id, "Appended version");
        Ok(())
    }
}

#[async_trait]
impl VersionStore for SqliteVersionStore {
    async fn commit(&self, record: VersionRecord, precondition: CommitPrecondition) -> Result<()> {
        // Runs on its own task: a caller that gives up mid-commit must not
        // hand a connection back to the pool with the transaction still open.
        let pool = self.pool.clone();
        tokio::spawn(async move {
            // BEGIN IMMEDIATE takes the write lock up front, so the head read
            // and the append can't interleave with another writer.
            let mut conn = pool.acquire().await?;
            sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

            match Self::append(&mut conn, record, precondition).await {
                Ok(()) => {
                    sqlx::query("COMMIT").execute(&mut *conn).await?;
                    Ok(())
                }
                Err(e) => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("commit task failed: {}", e)))?
    }

    async fn head(&self, state_key: &str) -> Result<Option<VersionMeta>> {
        let mut conn = self.pool.acquire().await?;
        Self::head_on(&mut conn, state_key).await
    }

    async fn get(&self, state_key: &str, version: VersionId) -> Result<Option<VersionRecord>> {
        let query = Self::meta_columns(&mut Query::select())
            .column(Versions::Ciphertext)
            .from(Versions::Table)
            .and_where(Expr::col(Versions::StateKey).eq(state_key))
            .and_where(Expr::col(Versions::VersionId).eq(encode_u64(version.sequence())?))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(VersionRecord {
                meta: Self::meta_from_row(&row)?,
                ciphertext: row.get("ciphertext"),
            })),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        state_key: &str,
        after: Option<VersionId>,
        limit: usize,
    ) -> Result<Vec<VersionMeta>> {
        let after = encode_u64(after.map(|v| v.sequence()).unwrap_or(0))?;
        let query = Self::meta_columns(&mut Query::select())
            .from(Versions::Table)
            .and_where(Expr::col(Versions::StateKey).eq(state_key))
            .and_where(Expr::col(Versions::VersionId).gt(after))
            .order_by(Versions::VersionId, Order::Asc)
            .limit(limit as u64)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::meta_from_row).collect()
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let query = Query::select()
            .distinct()
            .column(Versions::StateKey)
            .from(Versions::Table)
            .order_by(Versions::StateKey, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|row| row.get("state_key")).collect())
    }
}
