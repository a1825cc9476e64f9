//! Drives one scraper process: reads its line-delimited JSON as it arrives,
//! hands each record to a [`RecordHandler`] on its own task, and reports the
//! run's outcome once the process has exited and every task has settled.
//!
//! ```text
//! Starting ─► Streaming ─► Draining ─► Succeeded
//!                                  └─► Failed
//! ```
//!
//! The first malformed line or handler failure kills the process. Tasks
//! already dispatched are still awaited.

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, Command};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 8192;
const SNIPPET_CHARS: usize = 120;
const DIAGNOSTIC_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("scraper executable `{0}` not found in the configured path, working-directory ancestors or PATH")]
    ScraperNotFound(String),

    #[error("failed to launch scraper: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed reading scraper output: {0}")]
    Read(#[source] std::io::Error),

    #[error("malformed JSON on scraper output line {line} ({snippet:?}): {source}")]
    MalformedLine {
        line: usize,
        snippet: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("persisting a record failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("scraper exited with {status} without producing any records")]
    ScraperExited { status: ExitStatus, diagnostics: String },
}

/// Consumer of parsed records. Called concurrently, one task per record.
#[async_trait]
pub trait RecordHandler: Send + Sync + 'static {
    async fn handle(&self, record: Value) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Starting,
    Streaming,
    Draining,
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub struct StreamSummary {
    pub parsed: usize,
    pub status: ExitStatus,
    /// Everything the scraper wrote to stderr.
    pub diagnostics: String,
}

// ── Line framing ──────────────────────────────────────────────────────────────

/// Splits a byte stream into lines. Blank lines are dropped; line numbers
/// count them anyway so errors point at the right place.
///
/// `pending` never holds a newline between calls, so each push only scans
/// the bytes it appended.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
    line_no: usize,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<(usize, String)> {
        let scan_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for pos in scan_from..self.pending.len() {
            if self.pending[pos] == b'\n' {
                self.line_no += 1;
                if let Some(line) = frame(self.line_no, &self.pending[start..pos]) {
                    lines.push(line);
                }
                start = pos + 1;
            }
        }
        self.pending.drain(..start);
        lines
    }

    /// Whatever followed the last newline.
    fn finish(&mut self) -> Option<(usize, String)> {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            return None;
        }
        self.line_no += 1;
        frame(self.line_no, &rest)
    }
}

fn frame(line_no: usize, raw: &[u8]) -> Option<(usize, String)> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some((line_no, text.to_string()))
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

pub struct StreamController<H> {
    handler: Arc<H>,
    heartbeat: Duration,
    progress_interval: u64,
    phase: RunPhase,
    parsed: usize,
}

impl<H: RecordHandler> StreamController<H> {
    pub fn new(handler: Arc<H>, heartbeat: Duration, progress_interval: u64) -> Self {
        Self {
            handler,
            heartbeat: heartbeat.max(Duration::from_millis(10)),
            progress_interval,
            phase: RunPhase::Starting,
            parsed: 0,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Records parsed so far, including those of a failed run.
    pub fn parsed(&self) -> usize {
        self.parsed
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!("Stream phase: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    fn fail(&mut self, err: StreamError) -> Result<StreamSummary, StreamError> {
        self.enter(RunPhase::Failed);
        Err(err)
    }

    pub async fn run(&mut self, mut command: Command) -> Result<StreamSummary, StreamError> {
        self.enter(RunPhase::Starting);
        self.parsed = 0;

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return self.fail(StreamError::Spawn(e)),
        };
        let (Some(mut stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return self.fail(StreamError::Spawn(std::io::Error::other("scraper output was not captured")));
        };

        let last_output = Arc::new(Mutex::new(Instant::now()));
        let diagnostics = tokio::spawn(forward_diagnostics(stderr, Arc::clone(&last_output)));

        let mut pending: JoinSet<anyhow::Result<()>> = JoinSet::new();
        let mut failure: Option<StreamError> = None;
        let mut lines = LineBuffer::default();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.enter(RunPhase::Streaming);
        while failure.is_none() {
            tokio::select! {
                read = stdout.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        touch(&last_output);
                        for (line_no, line) in lines.push(&chunk[..n]) {
                            if let Err(e) = self.dispatch(line_no, &line, &mut pending) {
                                failure = Some(e);
                                break;
                            }
                        }
                    }
                    Err(e) => failure = Some(StreamError::Read(e)),
                },
                Some(joined) = pending.join_next(), if !pending.is_empty() => {
                    if let Err(e) = settle(joined) {
                        failure = Some(e);
                    }
                }
                _ = heartbeat.tick() => {
                    let idle = last_output.lock().map(|t| t.elapsed()).unwrap_or_default();
                    info!(
                        "Scraper still running: {} records parsed, last output {}s ago",
                        self.parsed,
                        idle.as_secs()
                    );
                }
            }
        }

        if let Some(err) = &failure {
            error!("Aborting scrape: {err}");
            if let Err(e) = child.start_kill() {
                debug!("Scraper already gone: {e}");
            }
        } else if let Some((line_no, line)) = lines.finish() {
            if let Err(e) = self.dispatch(line_no, &line, &mut pending) {
                failure = Some(e);
            }
        }

        self.enter(RunPhase::Draining);
        let status = child.wait().await;
        if !pending.is_empty() {
            debug!("Waiting for {} in-flight writes", pending.len());
        }
        while let Some(joined) = pending.join_next().await {
            if let Err(e) = settle(joined) {
                match failure {
                    None => failure = Some(e),
                    Some(_) => warn!("Further failure while draining: {e}"),
                }
            }
        }
        let diagnostics = diagnostics.await.unwrap_or_default();

        if let Some(err) = failure {
            return self.fail(err);
        }
        let status = match status {
            Ok(status) => status,
            Err(e) => return self.fail(StreamError::Read(e)),
        };
        if !status.success() && self.parsed == 0 {
            return self.fail(StreamError::ScraperExited { status, diagnostics });
        }

        if !status.success() {
            warn!("Scraper exited with {status} after {} records; keeping what was stored", self.parsed);
        }
        if !diagnostics.trim().is_empty() {
            warn!("Scraper reported diagnostics:\n{}", tail_lines(&diagnostics, DIAGNOSTIC_TAIL_LINES));
        }
        self.enter(RunPhase::Succeeded);
        Ok(StreamSummary {
            parsed: self.parsed,
            status,
            diagnostics,
        })
    }

    fn dispatch(
        &mut self,
        line_no: usize,
        line: &str,
        pending: &mut JoinSet<anyhow::Result<()>>,
    ) -> Result<(), StreamError> {
        let record: Value = serde_json::from_str(line).map_err(|source| StreamError::MalformedLine {
            line: line_no,
            snippet: line.chars().take(SNIPPET_CHARS).collect(),
            source,
        })?;

        self.parsed += 1;
        if self.progress_interval > 0 && self.parsed as u64 % self.progress_interval == 0 {
            info!("Parsed {} records ({} writes in flight)", self.parsed, pending.len());
        }

        let handler = Arc::clone(&self.handler);
        pending.spawn(async move { handler.handle(record).await });
        Ok(())
    }
}

fn settle(joined: Result<anyhow::Result<()>, JoinError>) -> Result<(), StreamError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(StreamError::Handler(e)),
        Err(e) => Err(StreamError::Handler(anyhow!("persistence task did not complete: {e}"))),
    }
}

fn touch(last_output: &Mutex<Instant>) {
    if let Ok(mut at) = last_output.lock() {
        *at = Instant::now();
    }
}

/// Copy the scraper's stderr to ours as it arrives, keeping a copy.
async fn forward_diagnostics(mut stderr: ChildStderr, last_output: Arc<Mutex<Instant>>) -> String {
    let mut sink = tokio::io::stderr();
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                touch(&last_output);
                if let Err(e) = sink.write_all(&chunk[..n]).await {
                    debug!("Could not forward scraper diagnostics: {e}");
                }
                let _ = sink.flush().await;
                collected.extend_from_slice(&chunk[..n]);
            }
            Err(e) => {
                debug!("Scraper stderr closed with error: {e}");
                break;
            }
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
