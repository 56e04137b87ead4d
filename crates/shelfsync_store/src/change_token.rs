//! Per-zone change token records.

use serde::{Deserialize, Serialize};
use shelfsync_model::{Cursor, ZoneId};

/// The resumption cursor for one remote zone.
///
/// There is at most one token per zone. No token means the next fetch starts
/// from an empty state. The cursor is opaque and is never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeToken {
    /// Zone the cursor belongs to.
    pub zone_id: ZoneId,
    /// Opaque cursor value.
    pub cursor: Cursor,
}

impl ChangeToken {
    /// Creates a token.
    pub fn new(zone_id: ZoneId, cursor: Cursor) -> Self {
        Self { zone_id, cursor }
    }
}
