use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::copier::CopyOptions;
use super::error::{Result, SyncError};
use super::progress::{EventReceiver, ProgressAggregator};
use super::scanner::PathEnumerator;
use super::task_manager::TaskManager;
use super::task_processor::LocalTaskProcessor;
use super::{
    default_workers, resolve_terminal, Phase, RunOutcome, RunSummary, SessionState, SyncRequest,
    TerminalPhase, TransferResult,
};
use crate::remote::{run_remote, RemoteClient, RemoteRequest, RemoteStore};
use crate::utils::log_buffer::{LogBuffer, LogEntry};

/// Knobs shared by every run of a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub copy: CopyOptions,
    /// Used when a request asks for 0 workers.
    pub default_workers: usize,
    pub log_entries: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            copy: CopyOptions::default(),
            default_workers: default_workers(),
            log_entries: 1000,
        }
    }
}

/// One local run: enumerate, then push every task through the pool.
///
/// Pure with respect to the session: everything it produces goes into
/// `progress`. The terminal event is left to the caller.
pub fn run(
    request: &SyncRequest,
    copy: CopyOptions,
    workers: usize,
    progress: &ProgressAggregator,
    cancel: &CancellationToken,
) -> TerminalPhase {
    progress.publish(Phase::Status, "", Some("Scanning sources...".to_string()));
    let enumeration = PathEnumerator::new(&request.dest_root).enumerate(&request.sources);

    progress.set_total(enumeration.total_bytes, enumeration.tasks.len());
    for result in enumeration.unprocessed {
        progress.record(result);
    }
    progress.publish(
        Phase::Status,
        "",
        Some(format!(
            "Found {} files ({} bytes)",
            enumeration.tasks.len(),
            enumeration.total_bytes
        )),
    );

    let processor = LocalTaskProcessor::new(copy);
    TaskManager::new(workers).run(&processor, enumeration.tasks, progress, cancel);
    resolve_terminal(&progress.snapshot().results, cancel.is_cancelled())
}

/// State machine around repeated runs of one session.
///
/// Idle -> Running -> Done | Error | Cancelled -> (acknowledge) -> Idle.
/// Each run gets a freshly armed cancellation token.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    options: SessionOptions,
    state: Mutex<SessionState>,
    cancel: Mutex<CancellationToken>,
    progress: ProgressAggregator,
    remote: Mutex<Option<Arc<dyn RemoteClient>>>,
    log_buffer: LogBuffer,
    started_at: Mutex<Option<i64>>,
}

/// Waits for a run started by [`SessionController::start`].
pub struct RunHandle {
    handle: JoinHandle<TerminalPhase>,
}

impl RunHandle {
    pub fn join(self) -> TerminalPhase {
        self.handle.join().unwrap_or_else(|_| {
            error!("Session thread panicked");
            TerminalPhase::Error
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub id: String,
    pub state: SessionState,
    pub percent: u8,
    pub total_bytes: u64,
    pub bytes_completed: u64,
    pub summary: RunSummary,
    pub logged_in: bool,
    pub started_at: Option<i64>,
    pub results: Vec<TransferResult>,
}

impl SessionController {
    pub fn new(id: impl Into<String>, options: SessionOptions) -> (Self, EventReceiver) {
        let id = id.into();
        let (progress, events) = ProgressAggregator::channel(id.clone());
        let inner = SessionInner {
            id,
            options,
            state: Mutex::new(SessionState::Idle),
            cancel: Mutex::new(CancellationToken::new()),
            progress,
            remote: Mutex::new(None),
            log_buffer: LogBuffer::new(options.log_entries),
            started_at: Mutex::new(None),
        };
        (Self { inner: Arc::new(inner) }, events)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.remote.lock().is_some()
    }

    /// Start a local sync. Rejected unless the session is Idle.
    pub fn start(&self, request: SyncRequest) -> Result<RunHandle> {
        let workers = self.workers(request.workers);
        info!(
            "Session {}: syncing {} source(s) into {} with {} workers",
            self.inner.id,
            request.sources.len(),
            request.dest_root.display(),
            workers
        );
        self.spawn(move |inner, cancel| {
            run(&request, inner.options.copy, workers, &inner.progress, cancel).into()
        })
    }

    /// Start an upload to the remote store. Needs a prior successful [`login`](Self::login).
    pub fn start_remote(&self, request: RemoteRequest) -> Result<RunHandle> {
        let client = self
            .inner
            .remote
            .lock()
            .clone()
            .ok_or_else(|| SyncError::NotAuthenticated(self.inner.id.clone()))?;
        let workers = self.workers(request.workers);
        info!(
            "Session {}: uploading {} with {} workers",
            self.inner.id,
            request.source.display(),
            workers
        );
        self.spawn(move |inner, cancel| run_remote(&request, client, workers, &inner.progress, cancel))
    }

    /// Request cancellation of the current run. Returns false when there was
    /// nothing left to cancel.
    pub fn cancel(&self) -> bool {
        if self.state() != SessionState::Running {
            return false;
        }
        let token = self.inner.cancel.lock();
        if token.is_cancelled() {
            return false;
        }
        info!("Session {}: cancel requested", self.inner.id);
        token.cancel();
        true
    }

    /// Front end has seen the terminal event; back to Idle.
    pub fn acknowledge(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state == SessionState::Running {
            return Err(SyncError::AlreadyRunning(self.inner.id.clone()));
        }
        *state = SessionState::Idle;
        Ok(())
    }

    /// Authenticate against `store`, publishing `LoginSuccess` or `LoginError`.
    pub fn login(&self, store: &dyn RemoteStore) -> Result<()> {
        match store.authenticate() {
            Ok(client) => {
                *self.inner.remote.lock() = Some(client);
                info!("Session {}: logged in to remote store", self.inner.id);
                self.inner.log_buffer.add_log("info", "Login successful".to_string(), None);
                self.inner.progress.publish(Phase::LoginSuccess, "", None);
                Ok(())
            }
            Err(e) => {
                *self.inner.remote.lock() = None;
                warn!("Session {}: login failed: {}", self.inner.id, e);
                self.inner.log_buffer.add_log("error", format!("Login failed: {}", e), None);
                self.inner.progress.publish(Phase::LoginError, "", Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        let snapshot = self.inner.progress.snapshot();
        SessionStatus {
            id: self.inner.id.clone(),
            state: self.state(),
            percent: snapshot.percent,
            total_bytes: snapshot.total_bytes,
            bytes_completed: snapshot.bytes_completed,
            summary: snapshot.summary(),
            logged_in: self.is_logged_in(),
            started_at: *self.inner.started_at.lock(),
            results: snapshot.results,
        }
    }

    pub fn logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        self.inner.log_buffer.get_logs(limit)
    }

    fn workers(&self, requested: usize) -> usize {
        if requested == 0 {
            self.inner.options.default_workers
        } else {
            requested
        }
    }

    /// Idle -> Running, with a fresh token and cleared counters.
    fn arm(&self) -> Result<CancellationToken> {
        let mut state = self.inner.state.lock();
        match *state {
            SessionState::Running => return Err(SyncError::AlreadyRunning(self.inner.id.clone())),
            s if s.is_terminal() => return Err(SyncError::NotIdle(self.inner.id.clone())),
            _ => {}
        }
        *state = SessionState::Running;

        let token = CancellationToken::new();
        *self.inner.cancel.lock() = token.clone();
        self.inner.progress.reset();
        *self.inner.started_at.lock() = Some(chrono::Utc::now().timestamp());
        Ok(token)
    }

    fn spawn<F>(&self, work: F) -> Result<RunHandle>
    where
        F: FnOnce(&SessionInner, &CancellationToken) -> RunOutcome + Send + 'static,
    {
        let token = self.arm()?;
        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{}", self.inner.id))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&inner, &token))).unwrap_or_else(|_| {
                    error!("Session {}: run panicked", inner.id);
                    TerminalPhase::Error.into()
                });
                let phase = outcome.phase;
                inner.finish(outcome);
                phase
            });

        match spawned {
            Ok(handle) => Ok(RunHandle { handle }),
            Err(e) => {
                error!("Session {}: could not start run: {}", self.inner.id, e);
                *self.inner.state.lock() = SessionState::Idle;
                Err(e.into())
            }
        }
    }
}

impl SessionInner {
    /// Record the outcome, move to the terminal state, then publish the
    /// terminal event so consumers that react to it see the new state.
    fn finish(&self, outcome: RunOutcome) {
        let phase = outcome.phase;
        let snapshot = self.progress.snapshot();
        let summary = snapshot.summary();
        for result in &snapshot.results {
            self.log_buffer.add_result(result);
        }

        let (percent, message) = match (phase, outcome.folder_id) {
            (TerminalPhase::Done, Some(folder_id)) => (100, format!("Upload complete: {}; folder {}", summary, folder_id)),
            (TerminalPhase::Done, None) => (100, summary.to_string()),
            (TerminalPhase::Error, _) => (snapshot.percent, format!("Some files failed; {}", summary)),
            (TerminalPhase::Cancelled, _) => (snapshot.percent, summary.to_string()),
        };
        info!("Session {} finished {:?}: {}", self.id, phase, summary);
        self.log_buffer.add_log("info", format!("Run finished: {}", summary), None);

        *self.state.lock() = phase.into();
        self.progress.publish_at(phase.into(), percent, Some(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryStore;
    use crate::sync::ProgressEvent;
    use std::fs;
    use tempfile::tempdir;

    fn drain(rx: &mut EventReceiver) -> Vec<ProgressEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[test]
    fn test_run_to_done_and_acknowledge() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();

        let (session, mut rx) = SessionController::new("tab-1", SessionOptions::default());
        let request = SyncRequest {
            sources: vec![src.path().to_path_buf()],
            dest_root: dst.path().to_path_buf(),
            workers: 2,
        };
        let phase = session.start(request.clone()).unwrap().join();

        assert_eq!(phase, TerminalPhase::Done);
        assert_eq!(session.state(), SessionState::Done);
        let events = drain(&mut rx);
        assert_eq!(events.first().unwrap().phase, Phase::Status);
        let last = events.last().unwrap();
        assert_eq!(last.phase, Phase::Done);
        assert_eq!(last.percent, 100);
        assert_eq!(last.message.as_deref(), Some("1 updated, 0 skipped, 0 errors, 0 cancelled"));

        assert!(matches!(session.start(request.clone()), Err(SyncError::NotIdle(_))));
        session.acknowledge().unwrap();
        assert_eq!(session.start(request).unwrap().join(), TerminalPhase::Done);
        assert_eq!(session.status().summary.skipped, 1);
    }

    #[test]
    fn test_missing_source_ends_in_error() {
        let dst = tempdir().unwrap();
        let (session, mut rx) = SessionController::new("s", SessionOptions::default());
        let phase = session
            .start(SyncRequest {
                sources: vec![dst.path().join("does-not-exist")],
                dest_root: dst.path().to_path_buf(),
                workers: 1,
            })
            .unwrap()
            .join();

        assert_eq!(phase, TerminalPhase::Error);
        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.phase, Phase::Error);
        assert!(last.message.unwrap().starts_with("Some files failed"));
        assert_eq!(session.logs(None).iter().filter(|l| l.level == "error").count(), 1);
    }

    #[test]
    fn test_cancel_when_idle_is_a_no_op() {
        let (session, _rx) = SessionController::new("s", SessionOptions::default());
        assert!(!session.cancel());
        assert!(!session.cancel());
        session.acknowledge().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_remote_requires_login() {
        let src = tempdir().unwrap();
        let (session, mut rx) = SessionController::new("cloud", SessionOptions::default());
        let request = RemoteRequest { source: src.path().to_path_buf(), workers: 1, parent_id: None };

        assert!(matches!(session.start_remote(request.clone()), Err(SyncError::NotAuthenticated(_))));

        assert!(session.login(&MemoryStore::rejecting("bad token")).is_err());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.phase, Phase::LoginError);
        assert_eq!(event.message.as_deref(), Some("authentication failed: bad token"));
        assert!(!session.is_logged_in());

        session.login(&MemoryStore::new()).unwrap();
        assert_eq!(rx.try_recv().unwrap().phase, Phase::LoginSuccess);
        fs::write(src.path().join("x.bin"), vec![7u8; 32]).unwrap();
        assert_eq!(session.start_remote(request).unwrap().join(), TerminalPhase::Done);

        let done: ProgressEvent = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
        assert_eq!(done.phase, Phase::Done);
        let message = done.message.unwrap();
        assert!(message.starts_with("Upload complete: 1 updated"), "{}", message);
        assert!(message.ends_with("; folder obj-1"), "{}", message);
    }
}
