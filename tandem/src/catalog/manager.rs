//! In-memory catalog backed by the item repository.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::catalog::{Headers, Item};
use crate::database::repositories::ItemRepository;
use crate::transfer::Transfer;
use crate::{Error, Result};

/// Catalog metadata supplied alongside a newly created transfer.
#[derive(Debug, Clone, Default)]
pub struct AddDownloadOptions {
    pub url: String,
    pub headers: Headers,
    pub child_hash: Option<String>,
    pub hidden: bool,
    pub children: bool,
    /// Directory as the client asked for it.
    pub download_location: PathBuf,
}

/// Resolves identifiers to items and keeps progress.
///
/// Progress is updated in memory from engine callbacks and written to the
/// repository on [`persist`](Self::persist) and [`close`](Self::close).
pub struct ItemManager {
    repo: Arc<dyn ItemRepository>,
    items: DashMap<String, Item>,
}

impl ItemManager {
    /// Load every stored item into memory.
    pub async fn load(repo: Arc<dyn ItemRepository>) -> Result<Self> {
        let items = DashMap::new();
        for model in repo.list_items().await? {
            let hash = model.hash.clone();
            match Item::from_db_model(model) {
                Ok(item) => {
                    items.insert(hash, item);
                }
                Err(e) => warn!(hash = %hash, error = %e, "Skipping unreadable catalog row"),
            }
        }
        info!(count = items.len(), "Catalog loaded");
        Ok(Self { repo, items })
    }

    /// Fresh identifier not present in the catalog.
    pub fn new_hash(&self) -> String {
        loop {
            let mut hash = uuid::Uuid::new_v4().simple().to_string();
            hash.truncate(12);
            if !self.items.contains_key(&hash) {
                return hash;
            }
        }
    }

    /// Register the item for a freshly created transfer.
    pub async fn add_download(
        &self,
        transfer: &dyn Transfer,
        options: AddDownloadOptions,
    ) -> Result<Item> {
        let item = Item {
            hash: transfer.hash().to_string(),
            name: transfer.file_name().to_string(),
            url: options.url,
            headers: options.headers,
            total_size: transfer.content_length(),
            downloaded: transfer.resumed_bytes(),
            child_hash: options.child_hash.filter(|h| !h.is_empty()),
            hidden: options.hidden,
            children: options.children,
            download_location: options.download_location,
            absolute_location: transfer.download_directory().to_path_buf(),
            resumable: transfer.resumable(),
            parts: transfer.parts(),
            completed: false,
            compiled: false,
            date_added: Utc::now(),
        };

        self.repo.upsert_item(&item.to_db_model()?).await?;
        self.items.insert(item.hash.clone(), item.clone());
        debug!(hash = %item.hash, name = %item.name, "Item registered");
        Ok(item)
    }

    pub fn get(&self, hash: &str) -> Result<Item> {
        self.items
            .get(hash)
            .map(|item| item.clone())
            .ok_or_else(|| Error::not_found("Item", hash))
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.items.contains_key(hash)
    }

    /// Snapshot of all items, oldest first.
    pub fn list_items(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.iter().map(|e| e.value().clone()).collect();
        items.sort_by(|a, b| {
            a.date_added
                .cmp(&b.date_added)
                .then_with(|| a.hash.cmp(&b.hash))
        });
        items
    }

    /// Add `bytes` to the downloaded counter, capped at the known total.
    pub fn record_progress(&self, hash: &str, bytes: u64) {
        if let Some(mut item) = self.items.get_mut(hash) {
            let next = item.downloaded.saturating_add(bytes);
            item.downloaded = if item.total_size > 0 {
                next.min(item.total_size)
            } else {
                next
            };
        }
    }

    pub fn set_downloaded(&self, hash: &str, bytes: u64) {
        if let Some(mut item) = self.items.get_mut(hash) {
            item.downloaded = bytes;
        }
    }

    pub fn mark_complete(&self, hash: &str, total: u64) {
        if let Some(mut item) = self.items.get_mut(hash) {
            if item.total_size == 0 {
                item.total_size = total;
            }
            item.downloaded = item.total_size.max(total);
            item.completed = true;
        }
    }

    pub fn mark_compiled(&self, hash: &str) {
        if let Some(mut item) = self.items.get_mut(hash) {
            item.compiled = true;
        }
    }

    /// Write the in-memory progress of `hash` to the repository.
    pub async fn persist(&self, hash: &str) -> Result<()> {
        let Some((downloaded, completed, compiled)) = self
            .items
            .get(hash)
            .map(|item| (item.downloaded, item.completed, item.compiled))
        else {
            return Ok(());
        };
        self.repo
            .update_progress(hash, downloaded as i64, completed, compiled)
            .await
    }

    /// Remove `hash` from the catalog and the repository.
    pub async fn flush(&self, hash: &str) -> Result<Item> {
        let item = self.get(hash)?;
        self.repo.delete_item(hash).await?;
        self.items.remove(hash);
        info!(hash = %hash, "Item flushed");
        Ok(item)
    }

    /// Persist every item. Called on shutdown.
    pub async fn close(&self) -> Result<()> {
        let hashes: Vec<String> = self.items.iter().map(|e| e.key().clone()).collect();
        for hash in hashes {
            if let Err(e) = self.persist(&hash).await {
                warn!(hash = %hash, error = %e, "Failed to persist item on close");
            }
        }
        Ok(())
    }
}
