//! Transfer engine traits and request types.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::{Headers, Item};
use crate::{Error, Result};

/// Per-transfer tuning, shared by fresh starts and resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Concurrent connections for this transfer.
    pub max_connections: u32,
    /// Number of segments the body is split into.
    pub max_parts: u32,
    /// Segment even when the server does not advertise range support.
    pub force_parts: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_connections: crate::config::DEFAULT_MAX_CONNECTIONS,
            max_parts: crate::config::DEFAULT_MAX_PARTS,
            force_parts: false,
        }
    }
}

impl TransferOptions {
    /// Override non-zero values from a client request.
    pub fn with_overrides(mut self, max_connections: u32, max_parts: u32, force_parts: bool) -> Self {
        if max_connections > 0 {
            self.max_connections = max_connections;
        }
        if max_parts > 0 {
            self.max_parts = max_parts;
        }
        self.force_parts |= force_parts;
        self
    }
}

/// A new transfer to create.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Identifier assigned before the engine sees the request.
    pub hash: String,
    pub url: String,
    /// Preferred file name; derived from the response when `None`.
    pub file_name: Option<String>,
    pub directory: PathBuf,
    pub headers: Headers,
    pub options: TransferOptions,
}

/// Receives the lifecycle of one transfer.
///
/// Engines call the methods from their worker tasks; implementations must not
/// block. `on_error` is invoked by the transfer driver when `download` fails,
/// never by the engine itself.
pub trait TransferSink: Send + Sync {
    fn on_progress(&self, bytes: u64);
    fn on_complete(&self, total: u64);
    fn on_stopped(&self);
    fn on_compile_start(&self);
    fn on_compile_progress(&self, bytes: u64);
    fn on_compile_complete(&self, total: u64);
    fn on_error(&self, error: &Error);
}

/// One running or resumable transfer.
#[async_trait]
pub trait Transfer: Send + Sync {
    fn hash(&self) -> &str;
    fn file_name(&self) -> &str;
    /// Total body size; 0 when the server did not report one.
    fn content_length(&self) -> u64;
    fn download_directory(&self) -> &Path;
    fn save_path(&self) -> PathBuf {
        self.download_directory().join(self.file_name())
    }
    fn resumable(&self) -> bool;
    fn parts(&self) -> u32;
    /// Bytes already on disk when the transfer was constructed.
    fn resumed_bytes(&self) -> u64;

    /// Run to completion, stop, or failure.
    ///
    /// Returns `Ok(())` after `on_complete` or `on_stopped` was emitted.
    async fn download(&self) -> Result<()>;

    /// Request a halt. Idempotent.
    fn stop(&self);
}

/// Creates and resumes transfers.
#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn create(
        &self,
        request: TransferRequest,
        sink: Arc<dyn TransferSink>,
    ) -> Result<Arc<dyn Transfer>>;

    async fn resume(
        &self,
        item: &Item,
        options: &TransferOptions,
        sink: Arc<dyn TransferSink>,
    ) -> Result<Arc<dyn Transfer>>;

    /// Remove partial artifacts left by an unfinished transfer.
    async fn discard(&self, item: &Item) -> Result<()>;
}
