//! Index progress and status reporting.
//!
//! Retrieval backends report two kinds of events while they initialize:
//! percentage progress (`{percent, message}`) and free-form status lines
//! (`{message}`). The server fans both out to connected clients through
//! [`BroadcastProgress`]; the `assist index` command writes them to stderr
//! so stdout stays parseable for scripts.
//!
//! Subscribers must tolerate events that arrive after the call that
//! triggered them has returned.

use serde::Serialize;
use std::io::Write;
use tokio::sync::broadcast;

/// A single event published by a retrieval backend.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum IndexEvent {
    Progress { percent: u8, message: String },
    Status { message: String },
}

/// Receives index events. Implementations must not block.
pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexEvent);
}

/// Report `done` out of `total` as a percentage progress event.
pub fn report_step(reporter: &dyn IndexProgressReporter, done: usize, total: usize, message: String) {
    reporter.report(IndexEvent::Progress {
        percent: percent(done, total),
        message,
    });
}

pub fn report_status(reporter: &dyn IndexProgressReporter, message: impl Into<String>) {
    reporter.report(IndexEvent::Status {
        message: message.into(),
    });
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}

/// Fans events out over two independent broadcast channels, one for
/// progress and one for status.
pub struct BroadcastProgress {
    progress: broadcast::Sender<IndexEvent>,
    status: broadcast::Sender<IndexEvent>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (progress, _) = broadcast::channel(capacity);
        let (status, _) = broadcast::channel(capacity);
        Self { progress, status }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<IndexEvent> {
        self.progress.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<IndexEvent> {
        self.status.subscribe()
    }
}

impl IndexProgressReporter for BroadcastProgress {
    fn report(&self, event: IndexEvent) {
        tracing::debug!(?event, "index event");
        let sender = match event {
            IndexEvent::Progress { .. } => &self.progress,
            IndexEvent::Status { .. } => &self.status,
        };
        // No subscribers is fine; events are best-effort.
        let _ = sender.send(event);
    }
}

/// Human-friendly progress on stderr: "index  42%  docs/setup.md".
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexEvent) {
        let line = match &event {
            IndexEvent::Progress { percent, message } => {
                format!("index {:>4}%  {}\n", percent, message)
            }
            IndexEvent::Status { message } => format!("index  {}\n", message),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
