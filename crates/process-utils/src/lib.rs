//! Child-process helpers for external tools driven by the daemon.
//!
//! Tools such as ffmpeg report machine-readable progress as `key=value` lines
//! (`-progress pipe:1`). This crate spawns such tools without flashing a
//! console window on Windows and turns their stdout into progress records.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Suppress the console window of spawned tools on Windows.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Build a background tool invocation: no console window, stdin closed.
#[cfg(feature = "tokio")]
pub fn tool_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.stdin(std::process::Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

/// One `key=value` record from a progress stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressRecord<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

impl<'a> ProgressRecord<'a> {
    /// Parse a single progress line. Blank lines and lines without `=` yield `None`.
    pub fn parse(line: &'a str) -> Option<Self> {
        let (key, value) = line.trim().split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        Some(Self {
            key,
            value: value.trim(),
        })
    }

    /// Numeric value, if the record carries one.
    pub fn as_u64(&self) -> Option<u64> {
        self.value.parse().ok()
    }

    /// `progress=end` marks the final block of a run.
    pub fn is_end(&self) -> bool {
        self.key == "progress" && self.value == "end"
    }
}

/// Tracks the `total_size=` counter of a progress stream and yields growth deltas.
#[derive(Debug, Default)]
pub struct SizeCounter {
    last: u64,
}

impl SizeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line; returns the number of new output bytes it reports.
    pub fn observe(&mut self, line: &str) -> Option<u64> {
        let record = ProgressRecord::parse(line)?;
        if record.key != "total_size" {
            return None;
        }
        let total = record.as_u64()?;
        if total <= self.last {
            return None;
        }
        let delta = total - self.last;
        self.last = total;
        Some(delta)
    }

    pub fn total(&self) -> u64 {
        self.last
    }
}

/// Outcome of [`run_with_progress`].
#[cfg(feature = "tokio")]
#[derive(Debug)]
pub struct ToolExit {
    pub status: std::process::ExitStatus,
    /// Last lines written to stderr, for error reporting.
    pub stderr_tail: String,
}

#[cfg(feature = "tokio")]
const STDERR_TAIL_LINES: usize = 20;

/// Spawn `cmd`, forward each stdout line to `on_line`, and wait for exit.
///
/// stdout and stderr are piped by this function.
#[cfg(feature = "tokio")]
pub async fn run_with_progress<F>(
    mut cmd: tokio::process::Command,
    mut on_line: F,
) -> std::io::Result<ToolExit>
where
    F: FnMut(&str),
{
    use tokio::io::{AsyncBufReadExt, BufReader};

    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    let mut child = cmd.spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr not captured"))?;

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into_iter().collect::<Vec<_>>().join("\n")
    });

    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines.next_line().await? {
        on_line(&line);
    }

    let status = child.wait().await?;
    let stderr_tail = stderr_task.await.unwrap_or_default();
    Ok(ToolExit {
        status,
        stderr_tail,
    })
}
