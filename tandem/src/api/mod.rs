//! Session API: the command handlers behind the WebSocket surface.
//!
//! Handlers are plain async methods on [`SessionApi`]; [`SessionApi::register_handlers`]
//! binds each one to its [`Method`] in a [`HandlerRegistry`].

pub mod active;
mod control;
mod download;
mod extension;
mod list;
pub mod reporter;
mod resume;

use std::path::PathBuf;
use std::sync::Arc;

use crate::Result;
use crate::catalog::ItemManager;
use crate::extension::ExtensionRegistry;
use crate::pipeline::DualStreamCoordinator;
use crate::server::pool::{Connection, ConnectionPool};
use crate::server::protocol::{
    DownloadIdParams, DownloadParams, FlushParams, GetExtensionParams, ListParams,
    LoadExtensionParams, Method, ResumeParams,
};
use crate::server::registry::HandlerRegistry;
use crate::transfer::{Transfer, TransferEngine, TransferOptions};

pub use active::{ActiveTransfer, ActiveTransfers, Reservation, spawn_transfer};
pub use list::filter_items;
pub use reporter::{EventReporter, SessionSink};

/// Defaults applied to requests that leave a field empty.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub download_dir: PathBuf,
    pub options: TransferOptions,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            options: TransferOptions::default(),
        }
    }
}

/// Shared state of every command handler.
pub struct SessionApi {
    pool: Arc<ConnectionPool>,
    manager: Arc<ItemManager>,
    engine: Arc<dyn TransferEngine>,
    active: Arc<ActiveTransfers>,
    coordinator: DualStreamCoordinator,
    extensions: Arc<ExtensionRegistry>,
    defaults: SessionDefaults,
}

impl SessionApi {
    pub fn new(
        pool: Arc<ConnectionPool>,
        manager: Arc<ItemManager>,
        engine: Arc<dyn TransferEngine>,
        active: Arc<ActiveTransfers>,
        coordinator: DualStreamCoordinator,
        extensions: Arc<ExtensionRegistry>,
        defaults: SessionDefaults,
    ) -> Self {
        Self {
            pool,
            manager,
            engine,
            active,
            coordinator,
            extensions,
            defaults,
        }
    }

    pub fn active(&self) -> &Arc<ActiveTransfers> {
        &self.active
    }

    pub fn manager(&self) -> &Arc<ItemManager> {
        &self.manager
    }

    /// Whether `hash` is running on its own or as part of a running pair.
    fn is_busy(&self, hash: &str) -> bool {
        self.active.contains(hash) || self.coordinator.involves(hash)
    }

    /// Track `transfer` under its reservation and drive it on its own task.
    fn launch(
        &self,
        slot: Reservation,
        transfer: Arc<dyn Transfer>,
        reporter: Arc<EventReporter>,
        sink: Arc<SessionSink>,
    ) {
        slot.fill(ActiveTransfer {
            transfer: Arc::clone(&transfer),
            reporter,
        });
        spawn_transfer(
            transfer,
            sink,
            Arc::clone(&self.active),
            Arc::clone(&self.manager),
        );
    }

    /// Bind every command to its handler.
    pub fn register_handlers(self: &Arc<Self>, registry: &mut HandlerRegistry) -> Result<()> {
        let api = Arc::clone(self);
        registry.register(Method::Download, move |conn: Connection, params: DownloadParams| {
            let api = Arc::clone(&api);
            async move { api.download(conn, params).await }
        })?;

        let api = Arc::clone(self);
        registry.register(Method::Resume, move |conn: Connection, params: ResumeParams| {
            let api = Arc::clone(&api);
            async move { api.resume(conn, params).await }
        })?;

        let api = Arc::clone(self);
        registry.register(Method::Attach, move |conn: Connection, params: DownloadIdParams| {
            let api = Arc::clone(&api);
            async move { api.attach(conn, params).await }
        })?;

        let api = Arc::clone(self);
        registry.register(Method::Stop, move |_conn: Connection, params: DownloadIdParams| {
            let api = Arc::clone(&api);
            async move { api.stop(params).await }
        })?;

        let api = Arc::clone(self);
        registry.register(Method::Flush, move |_conn: Connection, params: FlushParams| {
            let api = Arc::clone(&api);
            async move { api.flush(params).await }
        })?;

        let api = Arc::clone(self);
        registry.register(Method::List, move |_conn: Connection, params: ListParams| {
            let api = Arc::clone(&api);
            async move { api.list(params) }
        })?;

        let api = Arc::clone(self);
        registry.register(Method::LoadExtension, move |_conn: Connection, params: LoadExtensionParams| {
            let api = Arc::clone(&api);
            async move { api.load_extension(params).await }
        })?;

        let api = Arc::clone(self);
        registry.register(Method::GetExtension, move |_conn: Connection, params: GetExtensionParams| {
            let api = Arc::clone(&api);
            async move { api.get_extension(params) }
        })?;

        Ok(())
    }
}
