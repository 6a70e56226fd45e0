//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// State versions table schema.
#[derive(Iden)]
pub enum Versions {
    #[iden = "state_versions"]
    Table,
    #[iden = "state_key"]
    StateKey,
    #[iden = "version_id"]
    VersionId,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "content_hash"]
    ContentHash,
    #[iden = "encryption_key_id"]
    EncryptionKeyId,
    #[iden = "fencing_token"]
    FencingToken,
    #[iden = "size"]
    Size,
    #[iden = "ciphertext"]
    Ciphertext,
}

/// Lock rows table schema.
#[derive(Iden)]
pub enum Locks {
    #[iden = "state_locks"]
    Table,
    #[iden = "state_key"]
    StateKey,
    #[iden = "holder_id"]
    HolderId,
    #[iden = "acquired_at"]
    AcquiredAt,
    #[iden = "expires_at"]
    ExpiresAt,
    #[iden = "fencing_token"]
    FencingToken,
    #[iden = "revision"]
    Revision,
}

/// SQL for creating the versions table.
///
/// The primary key doubles as the head CAS: two writers can never both
/// append the same version id.
pub const CREATE_VERSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS state_versions (
    state_key TEXT NOT NULL,
    version_id INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    encryption_key_id TEXT NOT NULL,
    fencing_token INTEGER NOT NULL,
    size INTEGER NOT NULL,
    ciphertext BLOB NOT NULL,
    PRIMARY KEY (state_key, version_id)
);
"#;

/// SQL for creating the locks table.
pub const CREATE_LOCKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS state_locks (
    state_key TEXT PRIMARY KEY,
    holder_id TEXT,
    acquired_at TEXT,
    expires_at TEXT,
    fencing_token INTEGER NOT NULL,
    revision INTEGER NOT NULL
);
"#;
