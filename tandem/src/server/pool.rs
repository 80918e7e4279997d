//! Per-download subscriber sets.
//!
//! Each connection owns a bounded outbound queue drained by its own writer
//! task. The pool only ever `try_send`s into those queues, so a broadcast
//! never waits on a socket and a stalled client cannot hold up anyone else.
//! A connection whose queue is full or closed is dropped from the set.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::protocol::{Action, DOWNLOADING_UPDATE, DownloadingEvent, Envelope, ErrorBody, Severity};

/// Serialized outbound frame, shared between subscribers.
pub type Frame = Arc<str>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The client is not draining its queue.
    Full,
    /// The client is gone.
    Closed,
}

/// Handle to one client's outbound queue.
#[derive(Debug, Clone)]
pub struct Connection {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Connection {}

impl Connection {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            tx,
        }
    }

    /// New connection plus the receiving end of its queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn try_send(&self, frame: Frame) -> Result<(), SendFailure> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Queue a direct reply, waiting for room. Returns `false` if the client is gone.
    pub async fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> bool {
        match encode(envelope) {
            Some(frame) => self.send(frame).await,
            None => false,
        }
    }
}

fn encode(envelope: &Envelope) -> Option<Frame> {
    match serde_json::to_string(envelope) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(error = %e, "Failed to encode envelope");
            None
        }
    }
}

/// Maps download identifiers to the connections observing them.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    downloads: DashMap<String, Vec<Connection>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `connection` to `id`. Returns `false` if it already was.
    pub fn add_download(&self, id: &str, connection: &Connection) -> bool {
        let mut subscribers = self.downloads.entry(id.to_string()).or_default();
        if subscribers.contains(connection) {
            return false;
        }
        subscribers.push(connection.clone());
        debug!(download_id = %id, connection = connection.id, "Subscriber attached");
        true
    }

    pub fn subscriber_count(&self, id: &str) -> usize {
        self.downloads.get(id).map(|s| s.len()).unwrap_or(0)
    }

    pub fn has_download(&self, id: &str) -> bool {
        self.downloads.contains_key(id)
    }

    /// Deliver `envelope` to every subscriber of `id`; returns how many accepted it.
    pub fn broadcast(&self, id: &str, envelope: &Envelope) -> usize {
        match encode(envelope) {
            Some(frame) => self.broadcast_frame(id, frame),
            None => 0,
        }
    }

    pub fn broadcast_event(&self, event: &DownloadingEvent) -> usize {
        match event_envelope(event) {
            Some(envelope) => self.broadcast(&event.download_id, &envelope),
            None => 0,
        }
    }

    fn broadcast_frame(&self, id: &str, frame: Frame) -> usize {
        let (delivered, now_empty) = {
            let Some(mut subscribers) = self.downloads.get_mut(id) else {
                return 0;
            };
            subscribers.retain(|conn| match conn.try_send(Arc::clone(&frame)) {
                Ok(()) => true,
                Err(SendFailure::Full) => {
                    warn!(download_id = %id, connection = conn.id, "Subscriber queue full, dropping subscriber");
                    false
                }
                Err(SendFailure::Closed) => {
                    debug!(download_id = %id, connection = conn.id, "Subscriber disconnected, dropping subscriber");
                    false
                }
            });
            (subscribers.len(), subscribers.is_empty())
        };
        if now_empty {
            self.downloads.remove_if(id, |_, subs| subs.is_empty());
        }
        delivered
    }

    /// Send a structured error to the subscribers of `id`.
    pub fn write_error(&self, id: &str, severity: Severity, message: impl Into<String>) -> usize {
        let envelope = Envelope::error(ErrorBody {
            severity,
            code: match severity {
                Severity::Critical => "TRANSFER_ERROR",
                Severity::Recoverable => "TRANSFER_WARNING",
            }
            .to_string(),
            message: message.into(),
            download_id: Some(id.to_string()),
        });
        self.broadcast(id, &envelope)
    }

    /// Deliver a terminal envelope and tear the subscriber set down.
    ///
    /// The set is removed before delivery, so a connection attaching
    /// concurrently starts a fresh set instead of receiving a stale terminal.
    pub fn finish(&self, id: &str, envelope: &Envelope) -> usize {
        let Some((_, subscribers)) = self.downloads.remove(id) else {
            return 0;
        };
        let Some(frame) = encode(envelope) else {
            return 0;
        };
        let delivered = subscribers
            .iter()
            .filter(|conn| conn.try_send(Arc::clone(&frame)).is_ok())
            .count();
        debug!(download_id = %id, delivered, "Subscriber set closed");
        delivered
    }

    /// Broadcast `download_stopped` for `id` and tear the set down.
    pub fn stop_download(&self, id: &str) -> usize {
        let event = DownloadingEvent::new(id, Action::DownloadStopped, 0);
        match event_envelope(&event) {
            Some(envelope) => self.finish(id, &envelope),
            None => 0,
        }
    }

    /// Forget a disconnected client everywhere.
    pub fn remove_connection(&self, connection_id: u64) {
        self.downloads
            .iter_mut()
            .for_each(|mut entry| entry.value_mut().retain(|c| c.id != connection_id));
        self.downloads.retain(|_, subs| !subs.is_empty());
    }
}

pub fn event_envelope(event: &DownloadingEvent) -> Option<Envelope> {
    match serde_json::to_value(event) {
        Ok(message) => Some(Envelope::update(DOWNLOADING_UPDATE, message)),
        Err(e) => {
            warn!(error = %e, "Failed to encode download event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn progress(id: &str, value: u64) -> DownloadingEvent {
        DownloadingEvent::new(id, Action::DownloadProgress, value)
    }

    #[test]
    fn test_broadcast_reaches_every_subscriber_in_order() {
        let pool = ConnectionPool::new();
        let (a, mut rx_a) = Connection::channel(8);
        let (b, mut rx_b) = Connection::channel(8);
        pool.add_download("d1", &a);
        pool.add_download("d1", &b);

        pool.broadcast_event(&progress("d1", 1));
        pool.broadcast_event(&progress("d1", 2));

        for rx in [&mut rx_a, &mut rx_b] {
            let values: Vec<u64> = drain(rx)
                .iter()
                .map(|f| f["update"]["message"]["value"].as_u64().unwrap())
                .collect();
            assert_eq!(values, vec![1, 2]);
        }
    }

    #[test]
    fn test_add_download_is_idempotent() {
        let pool = ConnectionPool::new();
        let (a, mut rx) = Connection::channel(8);
        assert!(pool.add_download("d1", &a));
        assert!(!pool.add_download("d1", &a));
        assert_eq!(pool.subscriber_count("d1"), 1);

        pool.broadcast_event(&progress("d1", 5));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_failed_subscriber_is_removed_without_affecting_others() {
        let pool = ConnectionPool::new();
        let (healthy, mut rx_healthy) = Connection::channel(8);
        let (gone, rx_gone) = Connection::channel(8);
        let (stalled, _rx_stalled) = Connection::channel(1);
        pool.add_download("d1", &healthy);
        pool.add_download("d1", &gone);
        pool.add_download("d1", &stalled);
        drop(rx_gone);

        assert_eq!(pool.broadcast_event(&progress("d1", 1)), 2);
        // stalled queue (capacity 1) is now full
        assert_eq!(pool.broadcast_event(&progress("d1", 2)), 1);
        assert_eq!(pool.subscriber_count("d1"), 1);
        assert_eq!(drain(&mut rx_healthy).len(), 2);
    }

    #[test]
    fn test_identifiers_are_isolated() {
        let pool = ConnectionPool::new();
        let (a, mut rx_a) = Connection::channel(8);
        let (b, mut rx_b) = Connection::channel(8);
        pool.add_download("d1", &a);
        pool.add_download("d2", &b);

        pool.broadcast_event(&progress("d1", 1));
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_stop_download_is_terminal_and_resets_set() {
        let pool = ConnectionPool::new();
        let (a, mut rx_a) = Connection::channel(8);
        pool.add_download("d1", &a);

        assert_eq!(pool.stop_download("d1"), 1);
        assert!(!pool.has_download("d1"));
        assert_eq!(pool.broadcast_event(&progress("d1", 9)), 0);

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["update"]["message"]["action"], "download_stopped");

        // Later attach starts a fresh set.
        assert!(pool.add_download("d1", &a));
        assert_eq!(pool.subscriber_count("d1"), 1);
    }

    #[test]
    fn test_late_attach_gets_no_replay() {
        let pool = ConnectionPool::new();
        let (early, _rx_early) = Connection::channel(8);
        let (late, mut rx_late) = Connection::channel(8);
        pool.add_download("d1", &early);
        pool.broadcast_event(&progress("d1", 1));

        pool.add_download("d1", &late);
        assert!(drain(&mut rx_late).is_empty());

        pool.broadcast_event(&progress("d1", 2));
        let frames = drain(&mut rx_late);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["update"]["message"]["value"], 2);
    }

    #[test]
    fn test_write_error_carries_severity() {
        let pool = ConnectionPool::new();
        let (a, mut rx) = Connection::channel(8);
        pool.add_download("d1", &a);
        pool.write_error("d1", Severity::Critical, "disk full");

        let frames = drain(&mut rx);
        assert_eq!(frames[0]["ok"], false);
        assert_eq!(frames[0]["error"]["severity"], "critical");
        assert_eq!(frames[0]["error"]["downloadId"], "d1");
        assert_eq!(frames[0]["error"]["message"], "disk full");
    }

    #[test]
    fn test_remove_connection_prunes_sets() {
        let pool = ConnectionPool::new();
        let (a, _rx_a) = Connection::channel(8);
        let (b, _rx_b) = Connection::channel(8);
        pool.add_download("d1", &a);
        pool.add_download("d2", &a);
        pool.add_download("d2", &b);

        pool.remove_connection(a.id());
        assert!(!pool.has_download("d1"));
        assert_eq!(pool.subscriber_count("d2"), 1);
    }
}
