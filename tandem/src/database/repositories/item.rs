//! Item repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::ItemDbModel;
use crate::{Error, Result};

/// Item repository trait.
#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn get_item(&self, hash: &str) -> Result<ItemDbModel>;
    async fn list_items(&self) -> Result<Vec<ItemDbModel>>;
    async fn upsert_item(&self, item: &ItemDbModel) -> Result<()>;
    async fn update_progress(
        &self,
        hash: &str,
        downloaded: i64,
        completed: bool,
        compiled: bool,
    ) -> Result<()>;
    async fn delete_item(&self, hash: &str) -> Result<()>;
}

/// SQLx implementation of ItemRepository.
pub struct SqlxItemRepository {
    pool: SqlitePool,
}

impl SqlxItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ItemRepository for SqlxItemRepository {
    async fn get_item(&self, hash: &str) -> Result<ItemDbModel> {
        sqlx::query_as::<_, ItemDbModel>("SELECT * FROM items WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Item", hash))
    }

    async fn list_items(&self) -> Result<Vec<ItemDbModel>> {
        let items =
            sqlx::query_as::<_, ItemDbModel>("SELECT * FROM items ORDER BY date_added, hash")
                .fetch_all(&self.pool)
                .await?;
        Ok(items)
    }

    async fn upsert_item(&self, item: &ItemDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO items (
                hash, name, url, headers, total_size, downloaded, child_hash,
                hidden, children, download_location, absolute_location,
                resumable, parts, completed, compiled, date_added
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                headers = excluded.headers,
                total_size = excluded.total_size,
                downloaded = excluded.downloaded,
                child_hash = excluded.child_hash,
                hidden = excluded.hidden,
                children = excluded.children,
                download_location = excluded.download_location,
                absolute_location = excluded.absolute_location,
                resumable = excluded.resumable,
                parts = excluded.parts,
                completed = excluded.completed,
                compiled = excluded.compiled
            "#,
        )
        .bind(&item.hash)
        .bind(&item.name)
        .bind(&item.url)
        .bind(&item.headers)
        .bind(item.total_size)
        .bind(item.downloaded)
        .bind(&item.child_hash)
        .bind(item.hidden)
        .bind(item.children)
        .bind(&item.download_location)
        .bind(&item.absolute_location)
        .bind(item.resumable)
        .bind(item.parts)
        .bind(item.completed)
        .bind(item.compiled)
        .bind(&item.date_added)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_progress(
        &self,
        hash: &str,
        downloaded: i64,
        completed: bool,
        compiled: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE items SET downloaded = ?, completed = ?, compiled = ? WHERE hash = ?",
        )
        .bind(downloaded)
        .bind(completed)
        .bind(compiled)
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_item(&self, hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM items WHERE hash = ?")
            .bind(hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
