//! Live progress snapshots and their fan-out to subscribers.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;

/// Where an upload is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Reading,
    Validating,
    Inserting,
    Complete,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Reading => "reading",
            Self::Validating => "validating",
            Self::Inserting => "inserting",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A point-in-time view of one upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub phase: Phase,
    pub rows_read: u64,
    /// Estimated row count, known only for in-memory uploads.
    pub total_rows: Option<u64>,
    pub bytes_read: u64,
    pub total_bytes: Option<u64>,
    pub inserted: u64,
    pub skipped: u64,
    pub error: Option<String>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            phase: Phase::Starting,
            rows_read: 0,
            total_rows: None,
            bytes_read: 0,
            total_bytes: None,
            inserted: 0,
            skipped: 0,
            error: None,
        }
    }
}

impl Progress {
    /// Completion percentage from bytes when the size is known, else rows.
    pub fn percent(&self) -> Option<f64> {
        if self.phase == Phase::Complete {
            return Some(100.0);
        }
        let ratio = match (self.total_bytes, self.total_rows) {
            (Some(total), _) if total > 0 => self.bytes_read as f64 / total as f64,
            (_, Some(total)) if total > 0 => self.rows_read as f64 / total as f64,
            _ => return None,
        };
        Some((ratio * 100.0).min(100.0))
    }
}

struct BroadcastState {
    snapshot: Progress,
    subscribers: Vec<mpsc::Sender<Progress>>,
}

/// Holds the latest [`Progress`] and pushes every change to subscribers.
///
/// Sends never block: a subscriber whose buffer is full misses that update
/// and sees a later one. Each channel keeps one slot beyond `buffer` for the
/// terminal snapshot, so the final phase and its error always arrive before
/// the channel closes. Reaching a terminal phase freezes the snapshot and
/// closes every subscriber channel.
pub struct ProgressBroadcaster {
    state: Mutex<BroadcastState>,
    buffer: usize,
}

impl ProgressBroadcaster {
    pub fn new(initial: Progress, buffer: usize) -> Self {
        Self {
            state: Mutex::new(BroadcastState {
                snapshot: initial,
                subscribers: Vec::new(),
            }),
            buffer: buffer.max(1),
        }
    }

    /// Register a subscriber; the current snapshot is delivered immediately.
    /// Subscribing after completion yields the final snapshot and a closed
    /// channel.
    pub fn subscribe(&self) -> mpsc::Receiver<Progress> {
        let (tx, rx) = mpsc::channel(self.buffer + 1);
        let mut state = self.lock();
        // a fresh channel always has room for the first message
        let _ = tx.try_send(state.snapshot.clone());
        if !state.snapshot.phase.is_terminal() {
            state.subscribers.push(tx);
        }
        rx
    }

    pub fn snapshot(&self) -> Progress {
        self.lock().snapshot.clone()
    }

    /// Apply `f` to the snapshot and notify subscribers. Returns `false`
    /// without touching anything once a terminal phase has been reached.
    pub fn update(&self, f: impl FnOnce(&mut Progress)) -> bool {
        let mut state = self.lock();
        if state.snapshot.phase.is_terminal() {
            return false;
        }
        f(&mut state.snapshot);

        let snapshot = state.snapshot.clone();
        let terminal = snapshot.phase.is_terminal();
        state.subscribers.retain(|tx| {
            if !terminal && tx.capacity() <= 1 {
                return !tx.is_closed();
            }
            match tx.try_send(snapshot.clone()) {
                Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if terminal {
            state.subscribers.clear();
        }
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BroadcastState> {
        // progress is plain data; a poisoned lock still holds a usable snapshot
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
