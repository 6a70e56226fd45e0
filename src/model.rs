//! Core data model: versions, lock rows, commit events.
//!
//! Object keys follow the `{state_key}/{version_id}` layout shared by the
//! primary store and every replica destination.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};

/// Monotonically increasing token issued by every successful lock acquire.
pub type FencingToken = u64;

/// Maximum accepted length of a state key, in bytes.
pub const MAX_STATE_KEY_LEN: usize = 1024;

/// Width of the zero-padded decimal rendering of a [`VersionId`].
const VERSION_ID_WIDTH: usize = 20;

/// Per-key version sequence number.
///
/// Rendered zero-padded so lexicographic object-key order equals creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(u64);

impl VersionId {
    /// First version written for any key.
    pub const FIRST: VersionId = VersionId(1);

    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }

    /// The version that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// The version before this one, if any.
    pub fn previous(&self) -> Option<Self> {
        (self.0 > 1).then(|| Self(self.0 - 1))
    }

    /// Version id to assign after `head` (or the first one for an empty key).
    pub fn after(head: Option<VersionId>) -> Self {
        head.map(|h| h.next()).unwrap_or(Self::FIRST)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = VERSION_ID_WIDTH)
    }
}

impl FromStr for VersionId {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>()
            .ok()
            .filter(|seq| *seq > 0)
            .map(VersionId)
            .ok_or_else(|| StateError::InvalidVersion(s.to_string()))
    }
}

/// Validate a state key.
///
/// Keys are `/`-separated paths such as `prod/network`. Empty segments, `.`
/// and `..` are rejected so keys map safely onto filesystem and object-store
/// paths. A segment that starts with a rendered version id (20 digits, alone
/// or followed by an extension) is reserved: it would collide with the
/// version objects of the parent key.
pub fn validate_state_key(key: &str) -> Result<()> {
    let invalid = |reason: &str| Err(StateError::InvalidKey(format!("{:?}: {}", key, reason)));

    if key.is_empty() {
        return invalid("empty key");
    }
    if key.len() > MAX_STATE_KEY_LEN {
        return invalid("key too long");
    }
    if key.chars().any(|c| c.is_control()) {
        return invalid("control characters");
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return invalid("empty or relative path segment");
    }
    if key.split('/').any(is_reserved_segment) {
        return invalid("segment is reserved for version objects");
    }
    Ok(())
}

fn is_reserved_segment(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    bytes.len() >= VERSION_ID_WIDTH
        && bytes[..VERSION_ID_WIDTH].iter().all(u8::is_ascii_digit)
        && bytes.get(VERSION_ID_WIDTH).is_none_or(|b| *b == b'.')
}

/// Format the object key for a version.
pub fn object_key(state_key: &str, version_id: VersionId) -> String {
    format!("{}/{}", state_key, version_id)
}

/// Metadata of an immutable state version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMeta {
    pub state_key: String,
    pub version_id: VersionId,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the stored (encrypted) bytes.
    pub content_hash: String,
    /// Master key that wrapped this version's data key.
    pub encryption_key_id: String,
    /// Fencing token of the lock holder that wrote this version.
    pub fencing_token: FencingToken,
    /// Stored size in bytes.
    pub size: u64,
}

impl VersionMeta {
    pub fn object_key(&self) -> String {
        object_key(&self.state_key, self.version_id)
    }
}

/// A version as persisted: metadata plus encrypted envelope bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub meta: VersionMeta,
    pub ciphertext: Vec<u8>,
}

impl VersionRecord {
    /// Whether the stored bytes still hash to the recorded content hash.
    pub fn is_intact(&self) -> bool {
        crate::crypto::content_hash(&self.ciphertext) == self.meta.content_hash
    }
}

/// A version returned to callers with its payload decrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateVersion {
    pub meta: VersionMeta,
    pub payload: Vec<u8>,
}

/// A row of the lock table.
///
/// The row outlives the lock itself: after release `holder_id` is cleared but
/// `fencing_token` is kept as a high-water mark so tokens never regress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub state_key: String,
    pub holder_id: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub fencing_token: FencingToken,
    /// Bumped on every write; the predicate of conditional writes.
    pub revision: u64,
}

impl LockEntry {
    /// The lock currently held on this row, if it has a holder and hasn't expired.
    pub fn active_lock(&self, now: DateTime<Utc>) -> Option<LockRecord> {
        let holder_id = self.holder_id.as_ref()?;
        if self.expires_at.is_some_and(|expires| expires <= now) {
            return None;
        }
        Some(self.to_record(holder_id))
    }

    /// The lock recorded on this row, expired or not.
    pub fn recorded_lock(&self) -> Option<LockRecord> {
        self.holder_id.as_ref().map(|holder| self.to_record(holder))
    }

    fn to_record(&self, holder_id: &str) -> LockRecord {
        LockRecord {
            state_key: self.state_key.clone(),
            holder_id: holder_id.to_string(),
            acquired_at: self.acquired_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
            expires_at: self.expires_at,
            fencing_token: self.fencing_token,
        }
    }
}

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub state_key: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub fencing_token: FencingToken,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// Emitted by the state store after every successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    pub version: VersionMeta,
}
