//! Registry of running transfers and the task that drives each one.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::reporter::EventReporter;
use crate::catalog::ItemManager;
use crate::transfer::{Transfer, TransferSink};
use crate::{Error, Result};

/// A transfer currently running, with the reporter that owns its terminal event.
#[derive(Clone)]
pub struct ActiveTransfer {
    pub transfer: Arc<dyn Transfer>,
    pub reporter: Arc<EventReporter>,
}

enum Slot {
    /// Claimed by a handler that is still preparing the transfer.
    Reserved,
    Running(ActiveTransfer),
}

/// At most one running transfer per identifier.
#[derive(Default)]
pub struct ActiveTransfers {
    entries: DashMap<String, Slot>,
}

/// Exclusive claim on an identifier, held while its transfer is prepared.
///
/// Dropping an unfilled reservation frees the identifier again.
pub struct Reservation {
    active: Arc<ActiveTransfers>,
    hash: String,
    filled: bool,
}

impl Reservation {
    /// Turn the claim into a running entry.
    pub fn fill(mut self, entry: ActiveTransfer) {
        self.active
            .entries
            .insert(self.hash.clone(), Slot::Running(entry));
        self.filled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.filled {
            self.active
                .entries
                .remove_if(&self.hash, |_, slot| matches!(slot, Slot::Reserved));
        }
    }
}

impl ActiveTransfers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `hash` before any work is done for it.
    pub fn reserve(self: &Arc<Self>, hash: &str) -> Result<Reservation> {
        match self.entries.entry(hash.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyActive(hash.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Slot::Reserved);
                Ok(Reservation {
                    active: Arc::clone(self),
                    hash: hash.to_string(),
                    filled: false,
                })
            }
        }
    }

    pub fn insert(&self, hash: &str, entry: ActiveTransfer) -> Result<()> {
        match self.entries.entry(hash.to_string()) {
            Entry::Occupied(_) => Err(Error::AlreadyActive(hash.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Slot::Running(entry));
                Ok(())
            }
        }
    }

    pub fn get(&self, hash: &str) -> Option<ActiveTransfer> {
        self.entries.get(hash).and_then(|slot| match slot.value() {
            Slot::Running(entry) => Some(entry.clone()),
            Slot::Reserved => None,
        })
    }

    /// Whether `hash` is running or reserved.
    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove `hash` if it still refers to `transfer`.
    fn release(&self, hash: &str, transfer: &Arc<dyn Transfer>) {
        self.entries.remove_if(hash, |_, slot| {
            matches!(slot, Slot::Running(entry) if Arc::ptr_eq(&entry.transfer, transfer))
        });
    }

    /// Halt every running transfer. Used on shutdown.
    pub fn stop_all(&self) {
        for slot in self.entries.iter() {
            if let Slot::Running(entry) = slot.value() {
                entry.transfer.stop();
            }
        }
    }
}

/// Run `transfer` on its own task.
///
/// A failed download is stopped and reported through `sink.on_error`. The
/// identifier is released and its progress persisted once the transfer ends.
pub fn spawn_transfer(
    transfer: Arc<dyn Transfer>,
    sink: Arc<dyn TransferSink>,
    active: Arc<ActiveTransfers>,
    manager: Arc<ItemManager>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let hash = transfer.hash().to_string();
        debug!(hash = %hash, "Transfer started");

        if let Err(e) = transfer.download().await {
            transfer.stop();
            sink.on_error(&e);
        }

        active.release(&hash, &transfer);
        if let Err(e) = manager.persist(&hash).await {
            warn!(hash = %hash, error = %e, "Failed to persist transfer progress");
        }
    })
}
