//! Segmented HTTP transfer engine.
//!
//! The body is split into byte ranges, each fetched into its own part file
//! under `<dir>/.<hash>.parts/`. Part files only ever grow, so their sizes are
//! the resume offsets. When every part is full the parts are concatenated
//! into the final file; that assembly is reported through the compile
//! callbacks of the sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT_ENCODING, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::{Headers, Item};
use crate::transfer::{Transfer, TransferEngine, TransferOptions, TransferRequest, TransferSink};
use crate::{Error, Result};

/// Segments smaller than this are not worth a separate connection.
pub const DEFAULT_MIN_SEGMENT_SIZE: u64 = 1024 * 1024;

/// Progress is reported in batches of at least this many bytes per segment.
const PROGRESS_BATCH_BYTES: u64 = 64 * 1024;

/// Configuration for [`HttpEngine`].
#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    pub min_segment_size: u64,
}

impl Default for HttpEngineConfig {
    fn default() -> Self {
        Self {
            min_segment_size: DEFAULT_MIN_SEGMENT_SIZE,
        }
    }
}

/// One byte range of the body. `end` is inclusive; `None` means "until EOF".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: u32,
    pub start: u64,
    pub end: Option<u64>,
}

impl Segment {
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }
}

/// Split `total` bytes into `parts` contiguous ranges of near-equal size.
pub fn plan_segments(total: u64, parts: u32) -> Vec<Segment> {
    if total == 0 {
        return vec![Segment {
            index: 0,
            start: 0,
            end: None,
        }];
    }
    let parts = u64::from(parts.max(1)).min(total);
    let base = total / parts;
    let remainder = total % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let len = base + u64::from(i < remainder);
            let segment = Segment {
                index: i as u32,
                start,
                end: Some(start + len - 1),
            };
            start += len;
            segment
        })
        .collect()
}

/// Number of segments for a new transfer.
pub fn segment_count(
    total: u64,
    supports_range: bool,
    options: &TransferOptions,
    min_segment_size: u64,
) -> u32 {
    if total == 0 || !(supports_range || options.force_parts) {
        return 1;
    }
    let max = u64::from(options.max_parts.max(1));
    if options.force_parts {
        return max.min(total) as u32;
    }
    let by_size = (total / min_segment_size.max(1)).max(1);
    max.min(by_size) as u32
}

/// Total size from a `Content-Range: bytes 0-0/1234` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.strip_prefix("bytes ")?.split_once('/')?;
    total.trim().parse().ok()
}

/// File name from a `Content-Disposition` header.
fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(start) = header.find("filename*=") {
        let rest = &header[start + 10..];
        if let Some(quote_start) = rest.find("''") {
            let encoded = &rest[quote_start + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim_matches('"')) {
                return Some(decoded.into_owned());
            }
        }
    }

    let start = header.find("filename=")?;
    let rest = &header[start + 9..];
    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        Some(stripped[..end].to_string())
    } else {
        let end = rest.find(';').unwrap_or(rest.len());
        Some(rest[..end].trim().to_string())
    }
}

/// Last non-empty path segment of `url`, percent-decoded.
fn file_name_from_url(url: &url::Url) -> Option<String> {
    let last = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    urlencoding::decode(last).ok().map(|s| s.into_owned())
}

/// Strip directories and characters that are invalid in file names.
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

fn part_dir(directory: &Path, hash: &str) -> PathBuf {
    directory.join(format!(".{hash}.parts"))
}

/// What the server told us about the resource.
#[derive(Debug)]
struct Probe {
    content_length: u64,
    supports_range: bool,
    suggested_filename: Option<String>,
}

/// HTTP(S) transfer engine backed by a shared `reqwest::Client`.
pub struct HttpEngine {
    client: Client,
    config: HttpEngineConfig,
}

impl HttpEngine {
    pub fn new(client: Client, config: HttpEngineConfig) -> Self {
        Self { client, config }
    }

    async fn probe(&self, url: &str, headers: &Headers) -> Result<Probe> {
        let response = request(&self.client, url, headers)
            .header(RANGE, "bytes=0-0")
            .send()
            .await?;

        let status = response.status();
        let suggested_filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition);

        let probe = if status == StatusCode::PARTIAL_CONTENT {
            let content_length = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .unwrap_or(0);
            Probe {
                content_length,
                supports_range: true,
                suggested_filename,
            }
        } else if status.is_success() {
            let supports_range = response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains("bytes"));
            Probe {
                content_length: response.content_length().unwrap_or(0),
                supports_range,
                suggested_filename,
            }
        } else {
            return Err(Error::transfer(format!("{url} answered {status}")));
        };

        debug!(
            url,
            content_length = probe.content_length,
            supports_range = probe.supports_range,
            "Probed resource"
        );
        Ok(probe)
    }
}

#[async_trait]
impl TransferEngine for HttpEngine {
    async fn create(
        &self,
        request: TransferRequest,
        sink: Arc<dyn TransferSink>,
    ) -> Result<Arc<dyn Transfer>> {
        let url = url::Url::parse(&request.url)
            .map_err(|e| Error::validation(format!("invalid url {}: {e}", request.url)))?;

        let probe = self.probe(url.as_str(), &request.headers).await?;

        let file_name = request
            .file_name
            .as_deref()
            .and_then(sanitize_file_name)
            .or_else(|| probe.suggested_filename.as_deref().and_then(sanitize_file_name))
            .or_else(|| file_name_from_url(&url).as_deref().and_then(sanitize_file_name))
            .unwrap_or_else(|| request.hash.clone());

        let directory = resolve_directory(&request.directory).await?;
        let parts = segment_count(
            probe.content_length,
            probe.supports_range,
            &request.options,
            self.config.min_segment_size,
        );

        let transfer = HttpTransfer::prepare(
            self.client.clone(),
            TransferLayout {
                hash: request.hash,
                url: url.to_string(),
                headers: request.headers,
                file_name,
                directory,
                content_length: probe.content_length,
                supports_range: probe.supports_range,
                parts,
            },
            request.options.max_connections,
            sink,
        )
        .await?;

        info!(
            hash = %transfer.layout.hash,
            file = %transfer.layout.file_name,
            size = transfer.layout.content_length,
            parts,
            "Transfer created"
        );
        Ok(Arc::new(transfer))
    }

    async fn resume(
        &self,
        item: &Item,
        options: &TransferOptions,
        sink: Arc<dyn TransferSink>,
    ) -> Result<Arc<dyn Transfer>> {
        let transfer = HttpTransfer::prepare(
            self.client.clone(),
            TransferLayout {
                hash: item.hash.clone(),
                url: item.url.clone(),
                headers: item.headers.clone(),
                file_name: item.name.clone(),
                directory: item.absolute_location.clone(),
                content_length: item.total_size,
                supports_range: item.resumable,
                parts: item.parts,
            },
            options.max_connections,
            sink,
        )
        .await?;

        debug!(
            hash = %item.hash,
            resumed_bytes = transfer.resumed,
            "Transfer resumed from part files"
        );
        Ok(Arc::new(transfer))
    }

    async fn discard(&self, item: &Item) -> Result<()> {
        let dir = part_dir(&item.absolute_location, &item.hash);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(path = %dir.display(), "Removed part files");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn resolve_directory(directory: &Path) -> Result<PathBuf> {
    let directory = if directory.as_os_str().is_empty() {
        std::env::current_dir()?
    } else if directory.is_relative() {
        std::env::current_dir()?.join(directory)
    } else {
        directory.to_path_buf()
    };
    tokio::fs::create_dir_all(&directory).await?;
    Ok(tokio::fs::canonicalize(&directory).await?)
}

fn request(client: &Client, url: &str, headers: &Headers) -> RequestBuilder {
    // Byte offsets must refer to the stored representation.
    let mut builder = client.get(url).header(ACCEPT_ENCODING, "identity");
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

/// Everything needed to locate and fetch a transfer's bytes.
#[derive(Debug, Clone)]
struct TransferLayout {
    hash: String,
    url: String,
    headers: Headers,
    file_name: String,
    directory: PathBuf,
    content_length: u64,
    supports_range: bool,
    parts: u32,
}

impl TransferLayout {
    fn part_dir(&self) -> PathBuf {
        part_dir(&self.directory, &self.hash)
    }

    fn part_path(&self, segment: &Segment) -> PathBuf {
        self.part_dir().join(segment.index.to_string())
    }

    fn ranged(&self, segments: &[Segment]) -> bool {
        self.supports_range || segments.len() > 1
    }
}

/// One segmented HTTP transfer.
pub struct HttpTransfer {
    client: Client,
    layout: TransferLayout,
    segments: Vec<Segment>,
    max_connections: u32,
    sink: Arc<dyn TransferSink>,
    cancel: CancellationToken,
    resumed: u64,
}

impl HttpTransfer {
    async fn prepare(
        client: Client,
        layout: TransferLayout,
        max_connections: u32,
        sink: Arc<dyn TransferSink>,
    ) -> Result<Self> {
        let segments = plan_segments(layout.content_length, layout.parts);
        let ranged = layout.ranged(&segments);
        let mut resumed = 0;
        for segment in &segments {
            resumed += existing_bytes(&layout.part_path(segment), segment, ranged).await;
        }
        Ok(Self {
            client,
            layout,
            segments,
            max_connections: max_connections.max(1),
            sink,
            cancel: CancellationToken::new(),
            resumed,
        })
    }

    /// Concatenate the part files into the final file.
    async fn assemble(&self) -> Result<u64> {
        self.sink.on_compile_start();

        let target = self.save_path();
        let mut output = tokio::fs::File::create(&target).await?;
        let mut total = 0;
        for segment in &self.segments {
            let mut part = tokio::fs::File::open(self.layout.part_path(segment)).await?;
            let copied = tokio::io::copy(&mut part, &mut output).await?;
            total += copied;
            self.sink.on_compile_progress(copied);
        }
        output.sync_all().await?;

        if self.layout.content_length > 0 && total != self.layout.content_length {
            return Err(Error::transfer(format!(
                "assembled {total} bytes, expected {}",
                self.layout.content_length
            )));
        }

        if let Err(e) = tokio::fs::remove_dir_all(self.layout.part_dir()).await {
            warn!(hash = %self.layout.hash, error = %e, "Failed to remove part files");
        }

        self.sink.on_compile_complete(total);
        Ok(total)
    }
}

/// Usable bytes already in a part file. Oversized or non-resumable parts are reset.
async fn existing_bytes(path: &Path, segment: &Segment, ranged: bool) -> u64 {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return 0;
    };
    let len = metadata.len();
    match segment.len() {
        Some(expected) if ranged && len <= expected => len,
        None if ranged => len,
        _ => 0,
    }
}

#[async_trait]
impl Transfer for HttpTransfer {
    fn hash(&self) -> &str {
        &self.layout.hash
    }

    fn file_name(&self) -> &str {
        &self.layout.file_name
    }

    fn content_length(&self) -> u64 {
        self.layout.content_length
    }

    fn download_directory(&self) -> &Path {
        &self.layout.directory
    }

    fn resumable(&self) -> bool {
        self.layout.supports_range
    }

    fn parts(&self) -> u32 {
        self.segments.len() as u32
    }

    fn resumed_bytes(&self) -> u64 {
        self.resumed
    }

    async fn download(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.layout.part_dir()).await?;

        let ranged = self.layout.ranged(&self.segments);
        let semaphore = Arc::new(Semaphore::new(self.max_connections as usize));
        let mut tasks = JoinSet::new();

        for segment in self.segments.iter().copied() {
            let path = self.layout.part_path(&segment);
            let existing = existing_bytes(&path, &segment, ranged).await;
            if segment.len().is_some_and(|len| existing >= len) {
                continue;
            }
            let job = SegmentJob {
                client: self.client.clone(),
                url: self.layout.url.clone(),
                headers: self.layout.headers.clone(),
                path,
                segment,
                existing,
                ranged,
                cancel: self.cancel.clone(),
                sink: Arc::clone(&self.sink),
            };
            tasks.spawn(job.run(Arc::clone(&semaphore)));
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined
                .map_err(|e| Error::transfer(format!("segment task failed: {e}")))
                .and_then(|r| r);
            if let Err(e) = result
                && failure.is_none()
            {
                self.cancel.cancel();
                failure = Some(e);
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        if self.cancel.is_cancelled() {
            debug!(hash = %self.layout.hash, "Transfer stopped");
            self.sink.on_stopped();
            return Ok(());
        }

        let total = self.assemble().await?;
        info!(hash = %self.layout.hash, total, "Transfer complete");
        self.sink.on_complete(total);
        Ok(())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Fetch of one segment into its part file.
struct SegmentJob {
    client: Client,
    url: String,
    headers: Headers,
    path: PathBuf,
    segment: Segment,
    existing: u64,
    ranged: bool,
    cancel: CancellationToken,
    sink: Arc<dyn TransferSink>,
}

impl SegmentJob {
    async fn run(self, semaphore: Arc<Semaphore>) -> Result<()> {
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit
                .map_err(|_| Error::transfer("connection limiter closed"))?,
            _ = self.cancel.cancelled() => return Ok(()),
        };

        let index = self.segment.index;
        let from = self.segment.start + self.existing;
        let mut builder = request(&self.client, &self.url, &self.headers);
        if self.ranged {
            let range = match self.segment.end {
                Some(end) => format!("bytes={from}-{end}"),
                None => format!("bytes={from}-"),
            };
            builder = builder.header(RANGE, range);
        }

        let response = tokio::select! {
            response = builder.send() => response?,
            _ = self.cancel.cancelled() => return Ok(()),
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(Error::transfer(format!(
                "segment {index} range not satisfiable (resource changed on server?)"
            )));
        }
        if !status.is_success() {
            return Err(Error::transfer(format!("segment {index} answered {status}")));
        }
        if self.ranged && from > 0 && status != StatusCode::PARTIAL_CONTENT {
            return Err(Error::transfer(format!(
                "segment {index}: server ignored the range request"
            )));
        }

        let mut file = if self.existing > 0 {
            OpenOptions::new().append(true).open(&self.path).await?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)
                .await?
        };

        let limit = self.segment.len().map(|len| len - self.existing);
        let mut written: u64 = 0;
        let mut pending: u64 = 0;
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = self.cancel.cancelled() => break,
            };
            let Some(chunk) = next else { break };
            let mut chunk = chunk?;

            if let Some(limit) = limit {
                let room = limit - written;
                if chunk.len() as u64 > room {
                    chunk.truncate(room as usize);
                }
            }

            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            pending += chunk.len() as u64;
            if pending >= PROGRESS_BATCH_BYTES {
                self.sink.on_progress(pending);
                pending = 0;
            }

            if limit.is_some_and(|limit| written >= limit) {
                break;
            }
        }

        file.flush().await?;
        if pending > 0 {
            self.sink.on_progress(pending);
        }

        if !self.cancel.is_cancelled()
            && let Some(limit) = limit
            && written < limit
        {
            return Err(Error::transfer(format!(
                "segment {index} ended early after {written} of {limit} bytes"
            )));
        }

        Ok(())
    }
}
