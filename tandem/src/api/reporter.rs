//! Translation of engine callbacks into pool broadcasts.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::catalog::ItemManager;
use crate::server::pool::{ConnectionPool, event_envelope};
use crate::server::protocol::{Action, DownloadingEvent, Severity};
use crate::transfer::TransferSink;
use crate::Error;

#[derive(Debug, Default)]
struct ReporterState {
    terminated: bool,
    error_sent: bool,
}

/// Broadcast side of one download identifier.
///
/// Holds a terminal latch: once a terminal event (complete, stopped, or a
/// critical failure) went out, every later event for the identifier is
/// dropped. The latch is held while broadcasting, which keeps progress from
/// racing past the terminal event. At most one critical error is sent.
pub struct EventReporter {
    download_id: String,
    pool: Arc<ConnectionPool>,
    state: Mutex<ReporterState>,
}

impl EventReporter {
    pub fn new(download_id: impl Into<String>, pool: Arc<ConnectionPool>) -> Self {
        Self {
            download_id: download_id.into(),
            pool,
            state: Mutex::new(ReporterState::default()),
        }
    }

    pub fn download_id(&self) -> &str {
        &self.download_id
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Event for this identifier carrying a stream's own hash.
    pub fn event(&self, action: Action, hash: &str, value: u64) -> DownloadingEvent {
        DownloadingEvent::new(self.download_id.as_str(), action, value).with_hash(hash)
    }

    /// Broadcast a non-terminal event. Returns `false` after termination.
    pub fn emit(&self, event: DownloadingEvent) -> bool {
        let state = self.state.lock();
        if state.terminated {
            return false;
        }
        self.pool.broadcast_event(&event);
        true
    }

    /// Broadcast a terminal event and close the subscriber set.
    pub fn complete(&self, event: DownloadingEvent) -> bool {
        let mut state = self.state.lock();
        if state.terminated {
            return false;
        }
        state.terminated = true;
        if let Some(envelope) = event_envelope(&event) {
            self.pool.finish(&self.download_id, &envelope);
        }
        true
    }

    /// Send the critical error without ending the download yet.
    ///
    /// Used when a sibling stream keeps running; a later [`fail`](Self::fail)
    /// then only adds the stopped event.
    pub fn error(&self, message: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.terminated || state.error_sent {
            return false;
        }
        state.error_sent = true;
        let message = message.into();
        error!(download_id = %self.download_id, error = %message, "Download failed");
        self.pool
            .write_error(&self.download_id, Severity::Critical, message);
        true
    }

    /// One critical error, then one stopped event.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        let mut state = self.state.lock();
        if state.terminated {
            return false;
        }
        state.terminated = true;
        if !state.error_sent {
            state.error_sent = true;
            let message = message.into();
            error!(download_id = %self.download_id, error = %message, "Download failed");
            self.pool
                .write_error(&self.download_id, Severity::Critical, message);
        }
        self.pool.stop_download(&self.download_id);
        true
    }

    pub fn stop(&self) -> bool {
        let mut state = self.state.lock();
        if state.terminated {
            return false;
        }
        state.terminated = true;
        debug!(download_id = %self.download_id, "Download stopped");
        self.pool.stop_download(&self.download_id);
        true
    }
}

/// Sink for a standalone download: catalog progress plus broadcasts under its own id.
pub struct SessionSink {
    reporter: Arc<EventReporter>,
    manager: Arc<ItemManager>,
}

impl SessionSink {
    pub fn new(reporter: Arc<EventReporter>, manager: Arc<ItemManager>) -> Self {
        Self { reporter, manager }
    }

    fn hash(&self) -> &str {
        self.reporter.download_id()
    }
}

impl TransferSink for SessionSink {
    fn on_progress(&self, bytes: u64) {
        self.manager.record_progress(self.hash(), bytes);
        self.reporter
            .emit(self.reporter.event(Action::DownloadProgress, self.hash(), bytes));
    }

    fn on_complete(&self, total: u64) {
        self.manager.mark_complete(self.hash(), total);
        self.reporter
            .complete(self.reporter.event(Action::DownloadComplete, self.hash(), total));
    }

    fn on_stopped(&self) {
        self.reporter.stop();
    }

    fn on_compile_start(&self) {
        self.reporter
            .emit(self.reporter.event(Action::CompileStart, self.hash(), 0));
    }

    fn on_compile_progress(&self, bytes: u64) {
        self.reporter
            .emit(self.reporter.event(Action::CompileProgress, self.hash(), bytes));
    }

    fn on_compile_complete(&self, total: u64) {
        self.reporter
            .emit(self.reporter.event(Action::CompileComplete, self.hash(), total));
    }

    fn on_error(&self, error: &Error) {
        self.reporter.fail(error.to_string());
    }
}
