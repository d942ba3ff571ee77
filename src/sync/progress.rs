use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Phase, ProgressEvent, RunSummary, TransferResult};

pub type EventSender = mpsc::UnboundedSender<ProgressEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

/// Per-session byte counter, result collection and event publisher.
///
/// Every mutation goes through one lock, and events are sent while that lock
/// is held, so the percent values a consumer sees never go backwards.
pub struct ProgressAggregator {
    session_id: String,
    state: Mutex<ProgressState>,
    events: EventSender,
}

#[derive(Debug, Default)]
struct ProgressState {
    total_bytes: u64,
    bytes_completed: u64,
    results: Vec<TransferResult>,
}

impl ProgressState {
    fn percent(&self) -> u8 {
        percent(self.bytes_completed, self.total_bytes)
    }
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Default)]
pub struct ProgressSnapshot {
    pub total_bytes: u64,
    pub bytes_completed: u64,
    pub percent: u8,
    pub results: Vec<TransferResult>,
}

impl ProgressSnapshot {
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            total_bytes: self.total_bytes,
            bytes_completed: self.bytes_completed,
            ..RunSummary::from_results(&self.results)
        }
    }
}

/// floor(completed / total * 100), clamped to 0..=100. A zero total reads as 0%.
pub fn percent(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (completed as u128 * 100) / total as u128;
    pct.min(100) as u8
}

impl ProgressAggregator {
    pub fn new(session_id: impl Into<String>, events: EventSender) -> Self {
        Self {
            session_id: session_id.into(),
            state: Mutex::new(ProgressState::default()),
            events,
        }
    }

    /// Convenience constructor that also hands back the receiving end.
    pub fn channel(session_id: impl Into<String>) -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(session_id, tx), rx)
    }

    /// Clear counters and results ahead of a new run.
    pub fn reset(&self) {
        *self.state.lock() = ProgressState::default();
    }

    /// Fix the run's byte total. A non-empty task set that sums to zero bytes
    /// is counted as one byte so percentages stay defined.
    pub fn set_total(&self, total_bytes: u64, task_count: usize) {
        let mut state = self.state.lock();
        state.total_bytes = if task_count > 0 && total_bytes == 0 { 1 } else { total_bytes };
    }

    /// Add `bytes` to the counter and publish a `Downloading` event, atomically.
    pub fn advance(&self, bytes: u64, item_name: &str) -> u8 {
        let mut state = self.state.lock();
        state.bytes_completed = state.bytes_completed.saturating_add(bytes);
        let pct = state.percent();
        self.send(Phase::Downloading, pct, item_name, None);
        pct
    }

    /// Publish a non-progress event at the current percent.
    pub fn publish(&self, phase: Phase, item_name: &str, message: Option<String>) {
        let state = self.state.lock();
        self.send(phase, state.percent(), item_name, message);
    }

    /// Publish with an explicit percent. Used for the final `Done` event.
    pub fn publish_at(&self, phase: Phase, percent: u8, message: Option<String>) {
        let _state = self.state.lock();
        self.send(phase, percent.min(100), "", message);
    }

    pub fn record(&self, result: TransferResult) {
        self.state.lock().results.push(result);
    }

    pub fn percent(&self) -> u8 {
        self.state.lock().percent()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        ProgressSnapshot {
            total_bytes: state.total_bytes,
            bytes_completed: state.bytes_completed,
            percent: state.percent(),
            results: state.results.clone(),
        }
    }

    fn send(&self, phase: Phase, percent: u8, item_name: &str, message: Option<String>) {
        // A dropped receiver just means nobody is watching.
        let _ = self.events.send(ProgressEvent {
            session_id: self.session_id.clone(),
            phase,
            percent,
            item_name: item_name.to_string(),
            message,
        });
    }
}
