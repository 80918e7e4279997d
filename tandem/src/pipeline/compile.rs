//! Merging a video stream and its audio stream into one file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use process_utils::{SizeCounter, run_with_progress, tool_command};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Inputs and destination of one merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    pub video: PathBuf,
    pub audio: PathBuf,
    /// Final file; may be the same path as `video`.
    pub output: PathBuf,
}

/// Produces the merged file for a completed stream pair.
#[async_trait]
pub trait MediaCompiler: Send + Sync {
    /// Returns the size of the written output. `progress` receives output growth in bytes.
    async fn compile(&self, job: &CompileJob, progress: &(dyn Fn(u64) + Send + Sync)) -> Result<u64>;
}

/// Stream-copy remux through an ffmpeg binary.
pub struct FfmpegCompiler {
    ffmpeg_path: String,
}

impl FfmpegCompiler {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

/// Sibling path ffmpeg writes to before the result replaces `output`.
fn staging_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let name = match output.extension() {
        Some(ext) => format!(".{stem}.muxing.{}", ext.to_string_lossy()),
        None => format!(".{stem}.muxing"),
    };
    output.with_file_name(name)
}

#[async_trait]
impl MediaCompiler for FfmpegCompiler {
    async fn compile(&self, job: &CompileJob, progress: &(dyn Fn(u64) + Send + Sync)) -> Result<u64> {
        let staging = staging_path(&job.output);

        let mut cmd = tool_command(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-nostats", "-loglevel", "error", "-y"])
            .arg("-i")
            .arg(&job.video)
            .arg("-i")
            .arg(&job.audio)
            .args(["-map", "0:v:0", "-map", "1:a:0", "-c", "copy", "-progress", "pipe:1"]);
        if job.output.extension().is_none() {
            cmd.args(["-f", "mp4"]);
        }
        cmd.arg(&staging);

        debug!(video = %job.video.display(), audio = %job.audio.display(), "Starting ffmpeg merge");

        let mut counter = SizeCounter::new();
        let exit = run_with_progress(cmd, |line| {
            if let Some(delta) = counter.observe(line) {
                progress(delta);
            }
        })
        .await
        .map_err(|e| Error::Compile(format!("failed to run {}: {e}", self.ffmpeg_path)))?;

        if !exit.status.success() {
            if let Err(e) = tokio::fs::remove_file(&staging).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %staging.display(), error = %e, "Failed to remove staging file");
            }
            return Err(Error::Compile(format!(
                "ffmpeg exited with {}: {}",
                exit.status, exit.stderr_tail
            )));
        }

        tokio::fs::rename(&staging, &job.output).await?;
        let size = tokio::fs::metadata(&job.output).await?.len();
        info!(output = %job.output.display(), size, "Merge complete");
        Ok(size)
    }
}
