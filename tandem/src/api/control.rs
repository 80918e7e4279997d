//! `stop` and `flush`.

use tracing::{debug, info, warn};

use crate::api::SessionApi;
use crate::catalog::Item;
use crate::server::protocol::{DownloadIdParams, FlushParams, FlushResponse, StopResponse};
use crate::{Error, Result};

impl SessionApi {
    /// Halt a transfer. Unknown or finished identifiers only get a redundant stop broadcast.
    pub async fn stop(&self, params: DownloadIdParams) -> Result<StopResponse> {
        let hash = params.download_id;
        let stopped = match self.active.get(&hash) {
            Some(entry) => {
                entry.transfer.stop();
                entry.reporter.stop();
                info!(hash = %hash, "Download stopped by request");
                true
            }
            None => {
                debug!(hash = %hash, "Stop for inactive download");
                self.pool.stop_download(&hash);
                false
            }
        };
        Ok(StopResponse {
            download_id: hash,
            stopped,
        })
    }

    /// Remove items and their partial files.
    ///
    /// Without an identifier every inactive completed item is flushed.
    pub async fn flush(&self, params: FlushParams) -> Result<FlushResponse> {
        if let Some(hash) = params.download_id.filter(|h| !h.is_empty()) {
            self.flush_one(&hash).await?;
            return Ok(FlushResponse {
                flushed: vec![hash],
            });
        }

        let mut flushed = Vec::new();
        for item in self.manager.list_items() {
            if !item.is_complete() || self.is_busy(&item.hash) {
                continue;
            }
            match self.flush_one(&item.hash).await {
                Ok(item) => flushed.push(item.hash),
                Err(e) => warn!(hash = %item.hash, error = %e, "Failed to flush item"),
            }
        }
        info!(count = flushed.len(), "Flushed completed items");
        Ok(FlushResponse { flushed })
    }

    async fn flush_one(&self, hash: &str) -> Result<Item> {
        let item = self.manager.get(hash)?;
        if self.is_busy(hash) {
            return Err(Error::StillActive(hash.to_string()));
        }
        self.engine.discard(&item).await?;
        self.manager.flush(hash).await
    }
}
