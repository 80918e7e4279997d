//! Catalog item row.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One catalog entry as stored in the `items` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemDbModel {
    pub hash: String,
    pub name: String,
    pub url: String,
    /// JSON array of `[name, value]` pairs
    pub headers: String,
    pub total_size: i64,
    pub downloaded: i64,
    pub child_hash: Option<String>,
    pub hidden: bool,
    pub children: bool,
    pub download_location: String,
    pub absolute_location: String,
    pub resumable: bool,
    pub parts: i64,
    pub completed: bool,
    pub compiled: bool,
    /// RFC 3339 timestamp
    pub date_added: String,
}
