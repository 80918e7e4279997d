//! Coordination of a video stream and its paired audio stream.
//!
//! Both sides run as ordinary transfers. Each side owns a one-shot outcome
//! channel; a join barrier waits for both outcomes before anything is
//! decided, so a failing side never cuts its sibling short. The merge runs
//! exactly once, and only when both sides completed.
//!
//! All pair events are broadcast under the primary identifier, with `hash`
//! naming the side that produced them and `percentage` carrying the combined
//! progress. Part assembly inside either side is not reported; the only
//! `compile_*` events of a pair come from the merge. The pairing ends with
//! `compile_complete` on success, or with a single critical error followed by
//! `download_stopped`.

use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::api::active::{ActiveTransfer, ActiveTransfers, spawn_transfer};
use crate::api::reporter::EventReporter;
use crate::catalog::{AddDownloadOptions, Item, ItemManager};
use crate::pipeline::compile::{CompileJob, MediaCompiler};
use crate::pipeline::progress::{PairProgress, Side};
use crate::server::pool::{Connection, ConnectionPool};
use crate::server::protocol::{Action, Severity};
use crate::transfer::{Transfer, TransferEngine, TransferOptions, TransferRequest, TransferSink};
use crate::{Error, Result};

/// How one side of a pair ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideOutcome {
    Completed,
    Stopped,
    Failed(String),
}

/// Sink of one side: catalog progress, combined progress, and the side's outcome signal.
struct SideSink {
    side: Side,
    hash: String,
    reporter: Arc<EventReporter>,
    progress: Arc<PairProgress>,
    manager: Arc<ItemManager>,
    outcome: Mutex<Option<oneshot::Sender<SideOutcome>>>,
}

impl SideSink {
    fn signal(&self, outcome: SideOutcome) {
        if let Some(tx) = self.outcome.lock().take() {
            debug!(hash = %self.hash, side = ?self.side, outcome = ?outcome, "Pair side finished");
            let _ = tx.send(outcome);
        }
    }

    /// Report an already-downloaded side without running a transfer.
    fn synthesize_complete(&self) {
        let total = self
            .manager
            .get(&self.hash)
            .map(|item| item.total_size.max(item.downloaded))
            .unwrap_or(0);
        self.on_complete(total);
    }

    fn emit(&self, action: Action, value: u64, percentage: u8) {
        self.reporter.emit(
            self.reporter
                .event(action, &self.hash, value)
                .with_percentage(percentage),
        );
    }
}

impl TransferSink for SideSink {
    fn on_progress(&self, bytes: u64) {
        self.manager.record_progress(&self.hash, bytes);
        let percentage = self.progress.advance(self.side, bytes);
        self.emit(Action::DownloadProgress, bytes, percentage);
    }

    fn on_complete(&self, total: u64) {
        self.manager.mark_complete(&self.hash, total);
        let percentage = self.progress.complete(self.side, total);
        self.emit(Action::DownloadComplete, total, percentage);
        self.signal(SideOutcome::Completed);
    }

    fn on_stopped(&self) {
        self.signal(SideOutcome::Stopped);
    }

    // Part assembly of one side stays internal; the pair's compile events
    // belong to the merge alone.
    fn on_compile_start(&self) {
        debug!(hash = %self.hash, side = ?self.side, "Assembling side parts");
    }

    fn on_compile_progress(&self, _bytes: u64) {}

    fn on_compile_complete(&self, total: u64) {
        debug!(hash = %self.hash, side = ?self.side, total, "Side parts assembled");
    }

    fn on_error(&self, error: &Error) {
        let message = format!("{} stream {}: {error}", side_name(self.side), self.hash);
        self.reporter.error(message.clone());
        self.signal(SideOutcome::Failed(message));
    }
}

fn side_name(side: Side) -> &'static str {
    match side {
        Side::Primary => "primary",
        Side::Child => "child",
    }
}

/// Releases the pair's claim on its primary identifier when dropped.
struct UnitClaim {
    units: Arc<DashSet<String>>,
    primary: String,
}

impl Drop for UnitClaim {
    fn drop(&mut self) {
        self.units.remove(&self.primary);
    }
}

/// Wiring of one pair, built before either transfer exists.
struct Pairing {
    primary_hash: String,
    child_hash: String,
    reporter: Arc<EventReporter>,
    progress: Arc<PairProgress>,
    primary_sink: Arc<SideSink>,
    child_sink: Arc<SideSink>,
    primary_rx: oneshot::Receiver<SideOutcome>,
    child_rx: oneshot::Receiver<SideOutcome>,
    claim: UnitClaim,
}

/// Runs stream pairs and triggers their merge.
#[derive(Clone)]
pub struct DualStreamCoordinator {
    pool: Arc<ConnectionPool>,
    manager: Arc<ItemManager>,
    engine: Arc<dyn TransferEngine>,
    active: Arc<ActiveTransfers>,
    compiler: Arc<dyn MediaCompiler>,
    units: Arc<DashSet<String>>,
}

impl DualStreamCoordinator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        manager: Arc<ItemManager>,
        engine: Arc<dyn TransferEngine>,
        active: Arc<ActiveTransfers>,
        compiler: Arc<dyn MediaCompiler>,
    ) -> Self {
        Self {
            pool,
            manager,
            engine,
            active,
            compiler,
            units: Arc::new(DashSet::new()),
        }
    }

    /// Whether `hash` is either side of a running pair.
    pub fn involves(&self, hash: &str) -> bool {
        self.primary_of(hash).is_some()
    }

    /// Primary identifier of the running pair that `hash` belongs to.
    pub fn primary_of(&self, hash: &str) -> Option<String> {
        if self.units.contains(hash) {
            return Some(hash.to_string());
        }
        self.units
            .iter()
            .find(|primary| {
                self.manager
                    .get(primary.key())
                    .is_ok_and(|item| item.child() == Some(hash))
            })
            .map(|primary| primary.key().clone())
    }

    fn claim(&self, primary: &str) -> Result<UnitClaim> {
        if !self.units.insert(primary.to_string()) {
            return Err(Error::AlreadyActive(primary.to_string()));
        }
        Ok(UnitClaim {
            units: Arc::clone(&self.units),
            primary: primary.to_string(),
        })
    }

    fn pairing(&self, primary_hash: &str, child_hash: &str, claim: UnitClaim) -> Pairing {
        let reporter = Arc::new(EventReporter::new(primary_hash, Arc::clone(&self.pool)));
        let progress = Arc::new(PairProgress::new());
        let (primary_tx, primary_rx) = oneshot::channel();
        let (child_tx, child_rx) = oneshot::channel();

        let sink = |side: Side, hash: &str, tx: oneshot::Sender<SideOutcome>| {
            Arc::new(SideSink {
                side,
                hash: hash.to_string(),
                reporter: Arc::clone(&reporter),
                progress: Arc::clone(&progress),
                manager: Arc::clone(&self.manager),
                outcome: Mutex::new(Some(tx)),
            })
        };
        let primary_sink = sink(Side::Primary, primary_hash, primary_tx);
        let child_sink = sink(Side::Child, child_hash, child_tx);

        Pairing {
            primary_hash: primary_hash.to_string(),
            child_hash: child_hash.to_string(),
            reporter,
            progress,
            primary_sink,
            child_sink,
            primary_rx,
            child_rx,
            claim,
        }
    }

    /// Resolve the child of a new primary. Nothing is started on failure.
    fn resolve_child(&self, primary_hash: &str, child_hash: &str) -> Result<Item> {
        self.manager.get(child_hash).inspect_err(|e| {
            self.pool.write_error(
                primary_hash,
                Severity::Critical,
                format!("cannot resolve child stream {child_hash}: {e}"),
            );
        })
    }

    /// Resume `item` if it still has bytes to fetch.
    async fn resume_side(
        &self,
        pairing: &Pairing,
        item: &Item,
        side: Side,
        options: &TransferOptions,
    ) -> Result<Option<Arc<dyn Transfer>>> {
        let sink = match side {
            Side::Primary => Arc::clone(&pairing.primary_sink),
            Side::Child => Arc::clone(&pairing.child_sink),
        };
        if item.is_complete() {
            pairing
                .progress
                .reset(side, item.total_size.max(item.downloaded), item.total_size);
            return Ok(None);
        }
        let transfer = self
            .engine
            .resume(item, options, sink)
            .await
            .inspect_err(|e| {
                self.pool.write_error(
                    &pairing.primary_hash,
                    Severity::Critical,
                    format!("cannot resume {} stream {}: {e}", side_name(side), item.hash),
                );
            })?;
        self.manager.set_downloaded(&item.hash, transfer.resumed_bytes());
        pairing
            .progress
            .reset(side, transfer.resumed_bytes(), item.total_size);
        Ok(Some(transfer))
    }

    /// Start a new primary transfer paired with an existing child item.
    pub async fn start_pair(
        &self,
        conn: &Connection,
        request: TransferRequest,
        options: AddDownloadOptions,
    ) -> Result<Arc<dyn Transfer>> {
        let child_hash = options
            .child_hash
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::validation("paired start requires a child identifier"))?;

        let child = self.resolve_child(&request.hash, &child_hash)?;
        if self.active.contains(&child.hash) || self.involves(&child.hash) {
            return Err(Error::AlreadyActive(child.hash));
        }

        let claim = self.claim(&request.hash)?;
        let pairing = self.pairing(&request.hash, &child.hash, claim);
        let transfer_options = request.options.clone();

        let primary = self
            .engine
            .create(request, Arc::clone(&pairing.primary_sink) as Arc<dyn TransferSink>)
            .await?;
        self.manager.add_download(primary.as_ref(), options).await?;
        pairing.progress.reset(
            Side::Primary,
            primary.resumed_bytes(),
            primary.content_length(),
        );

        let child_transfer = self
            .resume_side(&pairing, &child, Side::Child, &transfer_options)
            .await?;

        self.pool.add_download(&pairing.primary_hash, conn);
        info!(primary = %pairing.primary_hash, child = %pairing.child_hash, "Starting stream pair");
        self.launch(pairing, Some(Arc::clone(&primary)), child_transfer);
        Ok(primary)
    }

    /// Resume a stored primary together with its child.
    pub async fn resume_pair(
        &self,
        conn: &Connection,
        primary: Item,
        options: &TransferOptions,
    ) -> Result<Item> {
        let child_hash = primary
            .child()
            .ok_or_else(|| Error::validation(format!("{} has no paired stream", primary.hash)))?
            .to_string();
        let child = self.resolve_child(&primary.hash, &child_hash)?;

        for hash in [&primary.hash, &child.hash] {
            if self.active.contains(hash) {
                return Err(Error::AlreadyActive(hash.clone()));
            }
        }
        let claim = self.claim(&primary.hash)?;

        if primary.compiled && primary.is_complete() && child.is_complete() {
            self.pool.add_download(&primary.hash, conn);
            let reporter = EventReporter::new(&primary.hash, Arc::clone(&self.pool));
            for item in [&primary, &child] {
                reporter.emit(
                    reporter
                        .event(Action::DownloadComplete, &item.hash, item.total_size)
                        .with_percentage(100),
                );
            }
            reporter.complete(
                reporter
                    .event(Action::CompileComplete, &primary.hash, primary.total_size)
                    .with_percentage(100),
            );
            drop(claim);
            return Ok(primary);
        }

        let pairing = self.pairing(&primary.hash, &child.hash, claim);
        let primary_transfer = self
            .resume_side(&pairing, &primary, Side::Primary, options)
            .await?;
        let child_transfer = self
            .resume_side(&pairing, &child, Side::Child, options)
            .await?;

        self.pool.add_download(&primary.hash, conn);
        info!(primary = %primary.hash, child = %child.hash, "Resuming stream pair");
        self.launch(pairing, primary_transfer, child_transfer);
        self.manager.get(&primary.hash)
    }

    /// Start both sides and hand the outcomes to the join barrier.
    fn launch(
        &self,
        pairing: Pairing,
        primary: Option<Arc<dyn Transfer>>,
        child: Option<Arc<dyn Transfer>>,
    ) {
        let Pairing {
            primary_hash,
            child_hash,
            reporter,
            primary_sink,
            child_sink,
            primary_rx,
            child_rx,
            claim,
            ..
        } = pairing;

        let child_reporter = Arc::new(EventReporter::new(&child_hash, Arc::clone(&self.pool)));
        let sides = [
            (primary_sink, primary, Arc::clone(&reporter)),
            (child_sink, child, child_reporter),
        ];
        for (sink, transfer, side_reporter) in sides {
            match transfer {
                Some(transfer) => {
                    let entry = ActiveTransfer {
                        transfer: Arc::clone(&transfer),
                        reporter: side_reporter,
                    };
                    if let Err(e) = self.active.insert(transfer.hash(), entry) {
                        sink.on_error(&e);
                        continue;
                    }
                    spawn_transfer(
                        transfer,
                        sink,
                        Arc::clone(&self.active),
                        Arc::clone(&self.manager),
                    );
                }
                None => sink.synthesize_complete(),
            }
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            let _claim = claim;
            let (primary_outcome, child_outcome) = tokio::join!(primary_rx, child_rx);
            let primary_outcome = primary_outcome
                .unwrap_or_else(|_| SideOutcome::Failed("primary stream ended without a result".into()));
            let child_outcome = child_outcome
                .unwrap_or_else(|_| SideOutcome::Failed("child stream ended without a result".into()));

            coordinator
                .settle(&primary_hash, &child_hash, &reporter, primary_outcome, child_outcome)
                .await;
        });
    }

    /// Decide the pair's fate once both sides are terminal.
    async fn settle(
        &self,
        primary_hash: &str,
        child_hash: &str,
        reporter: &Arc<EventReporter>,
        primary: SideOutcome,
        child: SideOutcome,
    ) {
        match (&primary, &child) {
            (SideOutcome::Completed, SideOutcome::Completed) => {
                self.compile(primary_hash, child_hash, reporter).await;
            }
            (SideOutcome::Failed(message), _) | (_, SideOutcome::Failed(message)) => {
                warn!(primary = %primary_hash, child = %child_hash, "Stream pair failed; merge skipped");
                reporter.fail(message.clone());
            }
            _ => {
                debug!(primary = %primary_hash, "Stream pair stopped; merge skipped");
                reporter.stop();
            }
        }
    }

    async fn compile(&self, primary_hash: &str, child_hash: &str, reporter: &Arc<EventReporter>) {
        let (primary, child) = match (self.manager.get(primary_hash), self.manager.get(child_hash)) {
            (Ok(primary), Ok(child)) => (primary, child),
            (Err(e), _) | (_, Err(e)) => {
                reporter.fail(format!("stream pair vanished before merge: {e}"));
                return;
            }
        };

        let job = CompileJob {
            video: primary.save_path(),
            audio: child.save_path(),
            output: primary.save_path(),
        };
        info!(primary = %primary_hash, output = %job.output.display(), "Merging stream pair");
        reporter.emit(
            reporter
                .event(Action::CompileStart, primary_hash, 0)
                .with_percentage(100),
        );

        let on_progress = |bytes: u64| {
            reporter.emit(
                reporter
                    .event(Action::CompileProgress, primary_hash, bytes)
                    .with_percentage(100),
            );
        };

        match self.compiler.compile(&job, &on_progress).await {
            Ok(total) => {
                self.manager.mark_compiled(primary_hash);
                if let Err(e) = self.manager.persist(primary_hash).await {
                    warn!(primary = %primary_hash, error = %e, "Failed to persist merge state");
                }
                reporter.complete(
                    reporter
                        .event(Action::CompileComplete, primary_hash, total)
                        .with_percentage(100),
                );
            }
            Err(e) => {
                reporter.fail(format!("merge failed: {e}"));
            }
        }
    }
}
