//! Shared fixtures: a scripted transfer engine, a counting compiler and a
//! container wired around them.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tandem::catalog::Item;
use tandem::config::DaemonConfig;
use tandem::database::repositories::{ItemRepository, SqlxItemRepository};
use tandem::database::{init_pool_with_size, run_migrations};
use tandem::pipeline::{CompileJob, MediaCompiler};
use tandem::server::pool::Frame;
use tandem::services::ServiceContainer;
use tandem::transfer::{Transfer, TransferEngine, TransferOptions, TransferRequest, TransferSink};
use tandem::{Error, Result};

/// One scripted engine action.
#[derive(Clone)]
pub enum Step {
    Progress(u64),
    /// Block until the gate is cancelled (opened) or the transfer is stopped.
    Wait(CancellationToken),
    /// Engine-side part assembly over the whole payload.
    Assemble,
    Complete,
    Fail(&'static str),
}

#[derive(Clone)]
pub struct Script {
    pub total: u64,
    pub steps: Vec<Step>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            total: 100,
            steps: vec![Step::Progress(100), Step::Complete],
        }
    }
}

pub struct ScriptedTransfer {
    hash: String,
    file_name: String,
    directory: PathBuf,
    total: u64,
    resumed: u64,
    steps: Vec<Step>,
    sink: Arc<dyn TransferSink>,
    stop: CancellationToken,
}

#[async_trait]
impl Transfer for ScriptedTransfer {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn content_length(&self) -> u64 {
        self.total
    }

    fn download_directory(&self) -> &Path {
        &self.directory
    }

    fn resumable(&self) -> bool {
        true
    }

    fn parts(&self) -> u32 {
        1
    }

    fn resumed_bytes(&self) -> u64 {
        self.resumed
    }

    async fn download(&self) -> Result<()> {
        for step in &self.steps {
            if self.stop.is_cancelled() {
                self.sink.on_stopped();
                return Ok(());
            }
            match step {
                Step::Progress(bytes) => self.sink.on_progress(*bytes),
                Step::Wait(gate) => {
                    tokio::select! {
                        _ = gate.cancelled() => {}
                        _ = self.stop.cancelled() => {
                            self.sink.on_stopped();
                            return Ok(());
                        }
                    }
                }
                Step::Assemble => {
                    self.sink.on_compile_start();
                    self.sink.on_compile_progress(self.total);
                    self.sink.on_compile_complete(self.total);
                }
                Step::Complete => {
                    self.sink.on_complete(self.total);
                    return Ok(());
                }
                Step::Fail(message) => return Err(Error::transfer(*message)),
            }
        }
        self.sink.on_complete(self.total);
        Ok(())
    }

    fn stop(&self) {
        self.stop.cancel();
    }
}

/// Engine whose transfers replay scripts keyed by URL.
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<String, Script>>,
    pub created: AtomicUsize,
    pub resumed: Mutex<Vec<String>>,
    pub discarded: Mutex<Vec<String>>,
    /// When set, `resume` blocks until the token is cancelled.
    pub resume_gate: Mutex<Option<CancellationToken>>,
}

impl ScriptedEngine {
    pub fn script(&self, url: &str, total: u64, steps: Vec<Step>) {
        self.scripts
            .lock()
            .insert(url.to_string(), Script { total, steps });
    }

    fn script_for(&self, url: &str) -> Script {
        self.scripts.lock().get(url).cloned().unwrap_or_default()
    }
}

fn name_from_url(url: &str) -> String {
    url.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

#[async_trait]
impl TransferEngine for ScriptedEngine {
    async fn create(
        &self,
        request: TransferRequest,
        sink: Arc<dyn TransferSink>,
    ) -> Result<Arc<dyn Transfer>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let script = self.script_for(&request.url);
        Ok(Arc::new(ScriptedTransfer {
            file_name: request
                .file_name
                .clone()
                .unwrap_or_else(|| name_from_url(&request.url)),
            hash: request.hash,
            directory: request.directory,
            total: script.total,
            resumed: 0,
            steps: script.steps,
            sink,
            stop: CancellationToken::new(),
        }))
    }

    async fn resume(
        &self,
        item: &Item,
        _options: &TransferOptions,
        sink: Arc<dyn TransferSink>,
    ) -> Result<Arc<dyn Transfer>> {
        self.resumed.lock().push(item.hash.clone());
        let gate = self.resume_gate.lock().clone();
        if let Some(gate) = gate {
            gate.cancelled().await;
        }
        let script = self.script_for(&item.url);
        Ok(Arc::new(ScriptedTransfer {
            hash: item.hash.clone(),
            file_name: item.name.clone(),
            directory: item.absolute_location.clone(),
            total: item.total_size,
            resumed: item.downloaded,
            steps: script.steps,
            sink,
            stop: CancellationToken::new(),
        }))
    }

    async fn discard(&self, item: &Item) -> Result<()> {
        self.discarded.lock().push(item.hash.clone());
        Ok(())
    }
}

/// Compiler that records its jobs instead of running ffmpeg.
#[derive(Default)]
pub struct CountingCompiler {
    pub calls: AtomicUsize,
    pub jobs: Mutex<Vec<CompileJob>>,
}

impl CountingCompiler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCompiler for CountingCompiler {
    async fn compile(&self, job: &CompileJob, progress: &(dyn Fn(u64) + Send + Sync)) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().push(job.clone());
        progress(64);
        Ok(128)
    }
}

pub struct Harness {
    pub container: ServiceContainer,
    pub engine: Arc<ScriptedEngine>,
    pub compiler: Arc<CountingCompiler>,
    pub dir: tempfile::TempDir,
}

/// Container over an in-memory catalog seeded with `items`.
pub async fn harness(items: &[Item]) -> Harness {
    let db = init_pool_with_size("sqlite::memory:", 1).await.unwrap();
    run_migrations(&db).await.unwrap();
    let repo = SqlxItemRepository::new(db);
    for item in items {
        repo.upsert_item(&item.to_db_model().unwrap()).await.unwrap();
    }

    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig {
        download_dir: dir.path().to_path_buf(),
        ..DaemonConfig::default()
    };
    let engine = Arc::new(ScriptedEngine::default());
    let compiler = Arc::new(CountingCompiler::default());
    let container = ServiceContainer::from_parts(
        &config,
        Arc::new(repo),
        engine.clone(),
        compiler.clone(),
    )
    .await
    .unwrap();

    Harness {
        container,
        engine,
        compiler,
        dir,
    }
}

pub fn item(hash: &str, downloaded: u64, total: u64) -> Item {
    Item {
        hash: hash.to_string(),
        name: format!("{hash}.mp4"),
        url: format!("http://media.test/{hash}"),
        headers: Vec::new(),
        total_size: total,
        downloaded,
        child_hash: None,
        hidden: false,
        children: false,
        download_location: PathBuf::from("downloads"),
        absolute_location: PathBuf::from("/srv/downloads"),
        resumable: true,
        parts: 1,
        completed: total > 0 && downloaded >= total,
        compiled: false,
        date_added: Utc::now(),
    }
}

/// Next frame within a second.
pub async fn next_frame(rx: &mut mpsc::Receiver<Frame>) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection queue closed");
    serde_json::from_str(&frame).unwrap()
}

/// Frames up to and including the first one matching `last`.
pub async fn frames_until(
    rx: &mut mpsc::Receiver<Frame>,
    last: impl Fn(&Value) -> bool,
) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let frame = next_frame(rx).await;
        let done = last(&frame);
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

/// Whatever arrives before the queue stays quiet for 100ms.
pub async fn drain_quiet(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        frames.push(serde_json::from_str(&frame).unwrap());
    }
    frames
}

pub fn action(frame: &Value) -> &str {
    frame["update"]["message"]["action"].as_str().unwrap_or("")
}

pub fn is_action(name: &'static str) -> impl Fn(&Value) -> bool {
    move |frame| action(frame) == name
}

/// Poll `cond` until it holds or a second passes.
pub async fn wait_until(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
