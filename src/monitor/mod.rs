//! Line classifier for supervised process output.
//!
//! The monitor owns the draining loop: it reads the process feed on its own
//! task so the child never blocks on a full pipe, classifies each line and
//! forwards typed [`OutputEvent`]s to a single consumer.

pub mod signatures;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::supervisor::managed_process::{LogLine, LogSource};
pub use signatures::Signatures;

/// Reason reported when the stream closes before authentication completed.
pub const EXITED_WITHOUT_AUTH: &str = "process exited without completing authentication";

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineKind {
    Plain,
    /// Provider selection menu
    ProviderPrompt,
    /// Device-login page. A line that also carries the code has it attached.
    AuthUrl {
        url: String,
        device_code: Option<String>,
    },
    DeviceCode { code: String },
    TunnelUrl { url: String },
    FatalError { reason: String },
}

impl LineKind {
    pub fn is_fatal(&self) -> bool {
        matches!(self, LineKind::FatalError { .. })
    }
}

/// One classified line. Produced once, consumed once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEvent {
    pub timestamp: u64,
    pub source: LogSource,
    pub raw_line: String,
    pub kind: LineKind,
}

#[derive(Debug, Clone, Default)]
pub struct OutputMonitor {
    signatures: Signatures,
}

impl OutputMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordered classification; the first matching rule wins.
    pub fn classify(&self, line: &str) -> LineKind {
        if let Some(sig) = self.signatures.fatal(line) {
            return LineKind::FatalError {
                reason: format!("fatal signature '{}': {}", sig, line.trim()),
            };
        }
        if let Some(url) = self.signatures.auth_url(line) {
            return LineKind::AuthUrl {
                url,
                device_code: self.signatures.device_code(line),
            };
        }
        if let Some(code) = self.signatures.device_code(line) {
            return LineKind::DeviceCode { code };
        }
        if let Some(url) = self.signatures.tunnel_url(line) {
            return LineKind::TunnelUrl { url };
        }
        if self.signatures.is_provider_prompt(line) {
            return LineKind::ProviderPrompt;
        }
        LineKind::Plain
    }

    /// Classify a raw log line into an event.
    ///
    /// Supervisor-generated lines (`LogSource::System`) are never scraped.
    pub fn event_for(&self, line: &LogLine) -> OutputEvent {
        let kind = match line.source {
            LogSource::System => LineKind::Plain,
            LogSource::Stdout | LogSource::Stderr => self.classify(&line.content),
        };
        OutputEvent {
            timestamp: line.timestamp,
            source: line.source,
            raw_line: line.content.clone(),
            kind,
        }
    }

    /// Spawn the draining loop over `feed`.
    ///
    /// When the feed closes without a fatal or tunnel line having been seen, a
    /// synthetic `FatalError` is emitted last. The loop keeps draining even
    /// after the event receiver is dropped.
    pub fn attach(self, mut feed: mpsc::Receiver<LogLine>) -> (mpsc::Receiver<OutputEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let task = tokio::spawn(async move {
            let mut concluded = false;
            let mut last_line = String::new();
            let mut consumer_alive = true;

            while let Some(line) = feed.recv().await {
                let event = self.event_for(&line);
                tracing::debug!("[monitor] {:?}: {}", event.kind, event.raw_line);
                if matches!(event.kind, LineKind::FatalError { .. } | LineKind::TunnelUrl { .. }) {
                    concluded = true;
                }
                if line.source != LogSource::System {
                    last_line = line.content.clone();
                }
                if consumer_alive && tx.send(event).await.is_err() {
                    consumer_alive = false;
                }
            }

            if !concluded && consumer_alive {
                tracing::warn!("Output stream closed before authentication completed");
                let _ = tx
                    .send(OutputEvent {
                        timestamp: crate::utils::current_timestamp(),
                        source: LogSource::System,
                        raw_line: last_line,
                        kind: LineKind::FatalError {
                            reason: EXITED_WITHOUT_AUTH.to_string(),
                        },
                    })
                    .await;
            }
        });

        (rx, task)
    }
}
