pub mod copier;
pub mod detector;
pub mod error;
pub mod manager;
pub mod progress;
pub mod registry;
pub mod scanner;
pub mod task_manager;
pub mod task_processor;

pub use copier::{ChunkedCopyEngine, CopyOptions};
pub use detector::ChangeDetector;
pub use error::SyncError;
pub use manager::{RunHandle, SessionController, SessionStatus};
pub use progress::{EventReceiver, EventSender, ProgressAggregator};
pub use registry::SessionManager;
pub use scanner::{Enumeration, PathEnumerator};
pub use task_manager::TaskManager;
pub use task_processor::{LocalTaskProcessor, TaskProcessor};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One source file paired with where it should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    pub size_bytes: u64,
}

impl SyncTask {
    /// File name used in progress events.
    pub fn item_name(&self) -> String {
        item_name(&self.source_path)
    }
}

pub(crate) fn item_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Updated,
    Skipped,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferResult {
    pub status: TransferStatus,
    pub path: PathBuf,
    pub message: String,
}

impl TransferResult {
    pub fn updated(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let message = format!("Updated: {}", path.display());
        Self { status: TransferStatus::Updated, path, message }
    }

    pub fn skipped(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let message = format!("Skipped: {}", path.display());
        Self { status: TransferStatus::Skipped, path, message }
    }

    /// Skipped without being compared, e.g. an entry that cannot be copied.
    pub fn passed_over(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        let path = path.into();
        let message = format!("Skipped {}: {}", path.display(), reason);
        Self { status: TransferStatus::Skipped, path, message }
    }

    pub fn cancelled(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let message = format!("Cancelled: {}", path.display());
        Self { status: TransferStatus::Cancelled, path, message }
    }

    pub fn error(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        let path = path.into();
        let message = format!("Error {}: {}", path.display(), err);
        Self { status: TransferStatus::Error, path, message }
    }
}

/// Phase tag carried by every progress event. Unknown phases fail to deserialize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Downloading,
    Status,
    Done,
    Error,
    Cancelled,
    LoginSuccess,
    LoginError,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Error | Phase::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub session_id: String,
    pub phase: Phase,
    pub percent: u8,
    pub item_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Running,
    Done,
    Error,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Error | SessionState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TerminalPhase {
    Done,
    Error,
    Cancelled,
}

impl From<TerminalPhase> for SessionState {
    fn from(phase: TerminalPhase) -> Self {
        match phase {
            TerminalPhase::Done => SessionState::Done,
            TerminalPhase::Error => SessionState::Error,
            TerminalPhase::Cancelled => SessionState::Cancelled,
        }
    }
}

impl From<TerminalPhase> for Phase {
    fn from(phase: TerminalPhase) -> Self {
        match phase {
            TerminalPhase::Done => Phase::Done,
            TerminalPhase::Error => Phase::Error,
            TerminalPhase::Cancelled => Phase::Cancelled,
        }
    }
}

/// How a run ended. Remote runs also report the store folder they filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub phase: TerminalPhase,
    pub folder_id: Option<String>,
}

impl From<TerminalPhase> for RunOutcome {
    fn from(phase: TerminalPhase) -> Self {
        Self { phase, folder_id: None }
    }
}

/// Any error wins; cancellation only counts once something was actually cut short.
pub fn resolve_terminal(results: &[TransferResult], cancel_requested: bool) -> TerminalPhase {
    if results.iter().any(|r| r.status == TransferStatus::Error) {
        return TerminalPhase::Error;
    }
    let cut_short = results.is_empty()
        || results.iter().any(|r| r.status == TransferStatus::Cancelled);
    if cancel_requested && cut_short {
        TerminalPhase::Cancelled
    } else {
        TerminalPhase::Done
    }
}

/// What a run asks for: one or more sources mirrored into a destination root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub sources: Vec<PathBuf>,
    pub dest_root: PathBuf,
    /// 0 picks the configured default.
    #[serde(default)]
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub cancelled: usize,
    pub total_bytes: u64,
    pub bytes_completed: u64,
}

impl RunSummary {
    pub fn from_results(results: &[TransferResult]) -> Self {
        let mut summary = RunSummary::default();
        for result in results {
            match result.status {
                TransferStatus::Updated => summary.updated += 1,
                TransferStatus::Skipped => summary.skipped += 1,
                TransferStatus::Error => summary.errors += 1,
                TransferStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} updated, {} skipped, {} errors, {} cancelled",
            self.updated, self.skipped, self.errors, self.cancelled
        )
    }
}

/// Worker count used when a request asks for 0: cpu count clamped to 2..=8.
pub fn default_workers() -> usize {
    num_cpus::get().clamp(2, 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_error_resolves_to_error() {
        let results = vec![
            TransferResult::updated("/a"),
            TransferResult::cancelled("/b"),
            TransferResult::error("/c", "boom"),
        ];
        assert_eq!(resolve_terminal(&results, true), TerminalPhase::Error);
        assert_eq!(resolve_terminal(&results, false), TerminalPhase::Error);
    }

    #[test]
    fn test_cancel_needs_a_cut_short_task() {
        let finished = vec![TransferResult::updated("/a"), TransferResult::skipped("/b")];
        assert_eq!(resolve_terminal(&finished, true), TerminalPhase::Done);
        assert_eq!(resolve_terminal(&[], true), TerminalPhase::Cancelled);
        assert_eq!(resolve_terminal(&[], false), TerminalPhase::Done);

        let cut = vec![TransferResult::updated("/a"), TransferResult::cancelled("/b")];
        assert_eq!(resolve_terminal(&cut, true), TerminalPhase::Cancelled);
    }

    #[test]
    fn test_event_schema() {
        let event = ProgressEvent {
            session_id: "tab-1".to_string(),
            phase: Phase::LoginSuccess,
            percent: 0,
            item_name: String::new(),
            message: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["phase"], "login_success");
        assert_eq!(json["sessionId"], "tab-1");
        assert!(json.get("message").is_none());

        let bad = r#"{"sessionId":"x","phase":"uploading","percent":1,"itemName":"a"}"#;
        assert!(serde_json::from_str::<ProgressEvent>(bad).is_err());
    }

    #[test]
    fn test_summary_counts() {
        let results = vec![
            TransferResult::updated("/a"),
            TransferResult::updated("/b"),
            TransferResult::skipped("/c"),
            TransferResult::cancelled("/d"),
        ];
        let summary = RunSummary::from_results(&results);
        assert_eq!(summary.to_string(), "2 updated, 1 skipped, 0 errors, 1 cancelled");
    }

    #[test]
    fn test_default_workers_clamped() {
        let workers = default_workers();
        assert!((2..=8).contains(&workers));
    }
}
