//! Catalog item domain type.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::database::models::ItemDbModel;
use crate::{Error, Result};

/// Request headers as ordered `(name, value)` pairs.
pub type Headers = Vec<(String, String)>;

/// One download known to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub hash: String,
    pub name: String,
    pub url: String,
    pub headers: Headers,
    pub total_size: u64,
    pub downloaded: u64,
    /// Paired audio/secondary stream, if any.
    pub child_hash: Option<String>,
    pub hidden: bool,
    /// Set on the secondary stream of a pair.
    pub children: bool,
    /// Directory as requested by the client.
    pub download_location: PathBuf,
    /// Resolved absolute directory the file lives in.
    pub absolute_location: PathBuf,
    pub resumable: bool,
    pub parts: u32,
    pub completed: bool,
    pub compiled: bool,
    pub date_added: DateTime<Utc>,
}

/// Floor percentage of `downloaded / total`, clamped to 100. Unknown totals report 0.
pub fn percentage(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (downloaded as u128 * 100) / total as u128;
    pct.min(100) as u8
}

impl Item {
    pub fn percentage(&self) -> u8 {
        if self.completed {
            100
        } else {
            percentage(self.downloaded, self.total_size)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed || (self.total_size > 0 && self.downloaded >= self.total_size)
    }

    /// Paired child identifier; an empty string means no pairing.
    pub fn child(&self) -> Option<&str> {
        self.child_hash.as_deref().filter(|h| !h.is_empty())
    }

    pub fn save_path(&self) -> PathBuf {
        self.absolute_location.join(&self.name)
    }

    pub fn to_db_model(&self) -> Result<ItemDbModel> {
        Ok(ItemDbModel {
            hash: self.hash.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            headers: serde_json::to_string(&self.headers)?,
            total_size: self.total_size as i64,
            downloaded: self.downloaded as i64,
            child_hash: self.child_hash.clone(),
            hidden: self.hidden,
            children: self.children,
            download_location: self.download_location.to_string_lossy().into_owned(),
            absolute_location: self.absolute_location.to_string_lossy().into_owned(),
            resumable: self.resumable,
            parts: self.parts as i64,
            completed: self.completed,
            compiled: self.compiled,
            date_added: self.date_added.to_rfc3339(),
        })
    }

    pub fn from_db_model(model: ItemDbModel) -> Result<Self> {
        let date_added = DateTime::parse_from_rfc3339(&model.date_added)
            .map_err(|e| Error::Other(format!("invalid date_added for {}: {e}", model.hash)))?
            .with_timezone(&Utc);
        Ok(Self {
            headers: serde_json::from_str(&model.headers)?,
            total_size: model.total_size.max(0) as u64,
            downloaded: model.downloaded.max(0) as u64,
            download_location: PathBuf::from(model.download_location),
            absolute_location: PathBuf::from(model.absolute_location),
            parts: model.parts.clamp(1, u32::MAX as i64) as u32,
            hash: model.hash,
            name: model.name,
            url: model.url,
            child_hash: model.child_hash,
            hidden: model.hidden,
            children: model.children,
            resumable: model.resumable,
            completed: model.completed,
            compiled: model.compiled,
            date_added,
        })
    }
}
