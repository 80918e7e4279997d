//! `resume` and `attach`.

use std::sync::Arc;

use tracing::{debug, info};

use crate::api::SessionApi;
use crate::api::reporter::{EventReporter, SessionSink};
use crate::server::pool::Connection;
use crate::server::protocol::{Action, DownloadIdParams, ItemResponse, ResumeParams};
use crate::{Error, Result};

impl SessionApi {
    /// Continue a stored download. A paired item resumes through the coordinator.
    pub async fn resume(&self, conn: Connection, params: ResumeParams) -> Result<ItemResponse> {
        let item = self.manager.get(&params.download_id)?;
        if self.is_busy(&item.hash) {
            return Err(Error::AlreadyActive(item.hash));
        }

        let options = self.defaults.options.clone().with_overrides(
            params.max_connections,
            params.max_segments,
            params.force_parts,
        );

        if item.child().is_some() {
            let item = self.coordinator.resume_pair(&conn, item, &options).await?;
            return Ok(ItemResponse::from(&item));
        }

        // Nothing is written for this id until the claim is held.
        let slot = self.active.reserve(&item.hash)?;
        let reporter = Arc::new(EventReporter::new(item.hash.as_str(), Arc::clone(&self.pool)));

        if item.is_complete() {
            debug!(hash = %item.hash, "Nothing left to fetch; reporting completion");
            let total = item.total_size.max(item.downloaded);
            self.manager.mark_complete(&item.hash, total);
            self.pool.add_download(&item.hash, &conn);
            reporter.complete(reporter.event(Action::DownloadComplete, &item.hash, total));
            drop(slot);
            return Ok(ItemResponse::from(&self.manager.get(&item.hash)?));
        }

        let sink = Arc::new(SessionSink::new(
            Arc::clone(&reporter),
            Arc::clone(&self.manager),
        ));
        let transfer = self
            .engine
            .resume(&item, &options, Arc::clone(&sink) as _)
            .await?;
        self.manager.set_downloaded(&item.hash, transfer.resumed_bytes());

        self.pool.add_download(&item.hash, &conn);
        self.launch(slot, transfer, reporter, sink);
        info!(hash = %item.hash, "Download resumed");
        Ok(ItemResponse::from(&self.manager.get(&item.hash)?))
    }

    /// Subscribe the caller to a running download. Past events are not replayed.
    ///
    /// Either side of a running pair attaches to the pair, whose events all
    /// travel under the primary identifier.
    pub async fn attach(&self, conn: Connection, params: DownloadIdParams) -> Result<ItemResponse> {
        let hash = match self.coordinator.primary_of(&params.download_id) {
            Some(primary) => primary,
            None if self.active.contains(&params.download_id) => params.download_id,
            None => return Err(Error::not_found("Active download", params.download_id)),
        };
        let item = self.manager.get(&hash)?;
        if self.pool.add_download(&hash, &conn) {
            debug!(hash = %hash, connection = conn.id(), "Connection attached");
        }
        Ok(ItemResponse::from(&item))
    }
}
