//! Managed Process - Direct process spawning with stdio capture
//!
//! The supervisor spawns every role through this type:
//! - Continuous stdout/stderr draining into a ring buffer
//! - A monitor feed that is created before the readers start
//! - stdin line injection (provider choice keystroke)
//! - Process exit tracking via a watch channel

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{mpsc, watch, Mutex};
use serde::{Serialize, Deserialize};

use super::environment::Environment;
use crate::utils::current_timestamp;

/// Default maximum number of log lines to keep in the ring buffer.
/// Can be overridden via `log_buffer_size` in the daemon config.
pub const DEFAULT_LOG_BUFFER: usize = 10_000;

/// Monitor feed capacity. When full, the readers wait for the monitor.
const MONITOR_FEED_CAPACITY: usize = 1024;

// ─── Log Types ───────────────────────────────────────────────

/// A single line of console output from the managed process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for polling (`GET /console?since=<id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    /// Where the line came from
    pub source: LogSource,
    /// Raw text content (invalid UTF-8 replaced)
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// System messages from the supervisor itself
    System,
}

// ─── Log Buffer ──────────────────────────────────────────────

/// Ring buffer that stores recent log lines with sequential IDs.
struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(DEFAULT_LOG_BUFFER)),
            next_id: 0,
            max_size,
        }
    }

    /// Push a new log line and return the created `LogLine`.
    fn push(&mut self, source: LogSource, content: String) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// Get all lines with id > `since_id` (for polling).
    fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter()
            .filter(|l| l.id > since_id)
            .cloned()
            .collect()
    }
}

/// Shared sink used by reader tasks: ring buffer + optional monitor feed.
#[derive(Clone)]
struct LineSink {
    buffer: Arc<Mutex<LogBuffer>>,
    feed: Option<mpsc::Sender<LogLine>>,
}

impl LineSink {
    /// 모니터 피드는 손실 없이 전달한다. 피드가 가득 차면 리더가 기다리고,
    /// 모니터가 피드를 버린 뒤에는 링 버퍼에만 남긴다.
    async fn push(&self, source: LogSource, content: String) {
        let line = self.buffer.lock().await.push(source, content);
        if let Some(feed) = &self.feed {
            let _ = feed.send(line).await;
        }
    }
}

// ─── Managed Process ─────────────────────────────────────────

/// A child process owned by the supervisor.
///
/// Provides:
/// - Async stdin line injection via `send_line()`
/// - Buffered console output via `get_console_since()`
/// - One lossless monitor feed via `take_output()` (when spawned monitored)
/// - Running state monitoring via `is_running()`
pub struct ManagedProcess {
    /// Channel to send lines to stdin
    stdin_tx: mpsc::Sender<String>,
    /// Log buffer for recent console output
    log_buffer: Arc<Mutex<LogBuffer>>,
    /// Feed for the output monitor, taken once
    output_rx: std::sync::Mutex<Option<mpsc::Receiver<LogLine>>>,
    /// Process PID
    pub pid: u32,
    /// Watch channel for running state
    running_rx: watch::Receiver<bool>,
    exit_code: Arc<std::sync::Mutex<Option<i32>>>,
}

impl ManagedProcess {
    /// Spawn a new managed process.
    ///
    /// The child receives exactly `env` (the inherited environment is cleared)
    /// and is detached into its own session so terminal interrupts aimed at
    /// the caller never reach it.
    ///
    /// With `monitored`, every line is also queued on a feed for
    /// [`take_output`](Self::take_output). Whoever takes it must keep
    /// draining it, otherwise the readers stall once the feed is full.
    pub async fn spawn(
        program: &str,
        args: &[String],
        working_dir: &Path,
        env: &Environment,
        log_buffer_size: usize,
        monitored: bool,
    ) -> std::io::Result<Self> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .env_clear()
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        crate::utils::apply_creation_flags(&mut cmd);
        crate::utils::detach_session(&mut cmd);

        let mut child = cmd.spawn()?;

        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "spawned process has no PID")
        })?;

        // Channels: the monitor feed exists before any reader runs
        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(64);
        let (feed_tx, feed_rx) = if monitored {
            let (tx, rx) = mpsc::channel::<LogLine>(MONITOR_FEED_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (running_tx, running_rx) = watch::channel(true);
        let exit_code = Arc::new(std::sync::Mutex::new(None));

        let log_buffer = Arc::new(Mutex::new(LogBuffer::with_capacity(log_buffer_size)));
        let sink = LineSink {
            buffer: log_buffer.clone(),
            feed: feed_tx,
        };

        sink.push(LogSource::System, format!("Process started with PID {}", pid)).await;

        // ── stdout / stderr readers ──────────────────────────
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(drain_lines(stdout, LogSource::Stdout, sink.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(drain_lines(stderr, LogSource::Stderr, sink.clone())));
        }

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin_handle) = child.stdin.take() {
            let mut rx = stdin_rx;
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    let data = if line.ends_with('\n') { line } else { format!("{}\n", line) };
                    if stdin_handle.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                    if stdin_handle.flush().await.is_err() {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        // 리더가 모두 끝난 뒤 종료 메시지를 남기고 sink 를 drop → 모니터 피드가 닫힌다
        {
            let exit_slot = exit_code.clone();
            tokio::spawn(async move {
                let exit_msg = match child.wait().await {
                    Ok(status) => {
                        if let Ok(mut slot) = exit_slot.lock() {
                            *slot = status.code();
                        }
                        format!("Process exited with {}", status)
                    }
                    Err(e) => format!("Failed to wait for process: {}", e),
                };
                tracing::info!("PID {}: {}", pid, exit_msg);
                let _ = running_tx.send(false);

                // 손자 프로세스가 파이프를 물고 있을 수 있으므로 리더 대기는 제한
                for reader in readers {
                    let _ = tokio::time::timeout(Duration::from_secs(2), reader).await;
                }
                sink.push(LogSource::System, exit_msg).await;
            });
        }

        Ok(Self {
            stdin_tx,
            log_buffer,
            output_rx: std::sync::Mutex::new(feed_rx),
            pid,
            running_rx,
            exit_code,
        })
    }

    /// Send a line to the process's stdin.
    pub async fn send_line(&self, line: &str) -> anyhow::Result<()> {
        self.stdin_tx.send(line.to_string()).await
            .map_err(|e| anyhow::anyhow!("stdin channel closed: {}", e))
    }

    /// Sender half of the stdin channel (for the auth negotiator).
    pub fn stdin_sender(&self) -> mpsc::Sender<String> {
        self.stdin_tx.clone()
    }

    /// Take the monitor feed. Only the first caller gets it; the feed closes
    /// once the process has exited and its streams are drained.
    pub fn take_output(&self) -> Option<mpsc::Receiver<LogLine>> {
        self.output_rx.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Get all log lines with `id > since_id`.
    pub async fn get_console_since(&self, since_id: u64) -> Vec<LogLine> {
        self.log_buffer.lock().await.get_since(since_id)
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Exit code once the process has been reaped (`None` when killed by a signal).
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|slot| *slot)
    }

    /// Wait until the process exits.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.running_rx.clone();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────

/// Read a stream line by line until EOF. Invalid UTF-8 is replaced rather than
/// ending the loop, so the pipe keeps draining.
async fn drain_lines<R>(stream: R, source: LogSource, sink: LineSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']).to_string();
                sink.push(source, line).await;
            }
            Err(e) => {
                tracing::warn!("{:?} read error: {}", source, e);
                sink.push(LogSource::System, format!("{:?} stream error: {}", source, e)).await;
                break;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────
