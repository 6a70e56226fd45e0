//! Opaque cursors for `list_versions`.
//!
//! A cursor names the last version of the previous page. Versions are
//! immutable, so resuming from a cursor always yields the same continuation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StateError};
use crate::model::{VersionId, VersionMeta};

/// One page of version metadata, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionPage {
    pub versions: Vec<VersionMeta>,
    /// Cursor for the following page; `None` on the last page.
    pub next_cursor: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct CursorToken {
    #[serde(rename = "k")]
    state_key: String,
    #[serde(rename = "a")]
    after: u64,
}

pub(crate) fn encode_cursor(state_key: &str, after: VersionId) -> String {
    let token = CursorToken {
        state_key: state_key.to_string(),
        after: after.sequence(),
    };
    // Serializing a two-field struct cannot fail.
    let json = serde_json::to_vec(&token).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub(crate) fn decode_cursor(state_key: &str, cursor: &str) -> Result<VersionId> {
    let invalid = |reason: &str| StateError::InvalidCursor(reason.to_string());

    let json = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| invalid("not base64"))?;
    let token: CursorToken = serde_json::from_slice(&json).map_err(|_| invalid("malformed"))?;
    if token.state_key != state_key {
        return Err(invalid("cursor belongs to another state key"));
    }
    if token.after == 0 {
        return Err(invalid("malformed"));
    }
    Ok(VersionId::new(token.after))
}
