use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::error::{Result, SyncError};
use super::manager::{RunHandle, SessionController, SessionOptions};
use super::{ProgressEvent, SyncRequest};
use crate::remote::RemoteRequest;

/// Independent sessions addressed by id, each with its own event fan-out.
///
/// A forwarding task drains each session's channel into a broadcast sender
/// so any number of front-end connections can follow along. Needs a tokio
/// runtime for that task.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    options: SessionOptions,
}

#[derive(Clone)]
struct SessionEntry {
    controller: SessionController,
    events: broadcast::Sender<ProgressEvent>,
    /// Thread of the latest run, kept so shutdown can wait for it.
    run: Arc<Mutex<Option<RunHandle>>>,
}

impl SessionManager {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            options,
        }
    }

    /// Create a session, or return the existing one with that id.
    pub fn create(&self, id: Option<String>) -> SessionController {
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get(&id) {
            return entry.controller.clone();
        }

        let (controller, mut rx) = SessionController::new(id.clone(), self.options);
        let (events, _) = broadcast::channel(256);
        let fan_out = events.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // No subscribers is fine; the status endpoint still has the totals.
                let _ = fan_out.send(event);
            }
            debug!("Event forwarder for session {} stopped", session_id);
        });

        info!("Created session {}", id);
        sessions.insert(
            id,
            SessionEntry {
                controller: controller.clone(),
                events,
                run: Arc::new(Mutex::new(None)),
            },
        );
        controller
    }

    fn entry(&self, id: &str) -> Result<SessionEntry> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownSession(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<SessionController> {
        self.entry(id).map(|entry| entry.controller)
    }

    pub fn subscribe(&self, id: &str) -> Result<broadcast::Receiver<ProgressEvent>> {
        self.entry(id).map(|entry| entry.events.subscribe())
    }

    /// Start a local run on session `id`; the run reports through its events.
    pub fn start(&self, id: &str, request: SyncRequest) -> Result<()> {
        let entry = self.entry(id)?;
        let handle = entry.controller.start(request)?;
        *entry.run.lock() = Some(handle);
        Ok(())
    }

    /// Start an upload on session `id`.
    pub fn start_remote(&self, id: &str, request: RemoteRequest) -> Result<()> {
        let entry = self.entry(id)?;
        let handle = entry.controller.start_remote(request)?;
        *entry.run.lock() = Some(handle);
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionController> {
        let mut sessions: Vec<_> = self.sessions.read().values().map(|e| e.controller.clone()).collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Cancel every running session. Returns how many were asked to stop.
    pub fn cancel_all(&self) -> usize {
        self.list().iter().filter(|session| session.cancel()).count()
    }

    /// Cancel every running session and wait until all run threads have
    /// exited. Returns how many were asked to stop.
    pub async fn shutdown(&self) -> usize {
        let cancelled = self.cancel_all();
        let handles: Vec<RunHandle> = self
            .sessions
            .read()
            .values()
            .filter_map(|entry| entry.run.lock().take())
            .collect();

        let pending = handles.len();
        let joined = tokio::task::spawn_blocking(move || {
            for handle in handles {
                handle.join();
            }
        })
        .await;
        match joined {
            Ok(()) => debug!("Joined {} session run(s)", pending),
            Err(e) => warn!("Waiting for session runs failed: {}", e),
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Phase, SessionState, TerminalPhase};
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let manager = SessionManager::new(SessionOptions::default());
        let a = manager.create(Some("a".to_string()));
        let b = manager.create(Some("b".to_string()));
        let mut a_events = manager.subscribe("a").unwrap();

        let src_a = tempdir().unwrap();
        let src_b = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src_a.path().join("one.txt"), vec![1u8; 100]).unwrap();
        fs::write(src_b.path().join("two.txt"), vec![2u8; 300]).unwrap();

        let run_a = a
            .start(SyncRequest { sources: vec![src_a.path().to_path_buf()], dest_root: dst.path().join("a"), workers: 2 })
            .unwrap();
        let run_b = b
            .start(SyncRequest { sources: vec![src_b.path().to_path_buf()], dest_root: dst.path().join("b"), workers: 2 })
            .unwrap();
        let (phase_a, phase_b) = tokio::task::spawn_blocking(move || (run_a.join(), run_b.join()))
            .await
            .unwrap();

        assert_eq!(phase_a, TerminalPhase::Done);
        assert_eq!(phase_b, TerminalPhase::Done);
        assert_eq!(a.status().total_bytes, 100);
        assert_eq!(b.status().total_bytes, 300);

        loop {
            let event = a_events.recv().await.unwrap();
            assert_eq!(event.session_id, "a");
            if event.phase == Phase::Done {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_lookup_fails_for_unknown() {
        let manager = SessionManager::new(SessionOptions::default());
        manager.create(Some("tab".to_string()));
        manager.create(Some("tab".to_string()));
        assert_eq!(manager.list().len(), 1);
        assert!(matches!(manager.get("nope"), Err(SyncError::UnknownSession(_))));
        assert_eq!(manager.cancel_all(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_cancelled_runs() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("big.bin"), vec![3u8; 64 * 1024 * 1024]).unwrap();
        let options = SessionOptions {
            copy: crate::sync::CopyOptions { large_file_threshold: 1, chunk_size: 4096 },
            ..SessionOptions::default()
        };
        let manager = SessionManager::new(options);
        let session = manager.create(Some("busy".to_string()));
        let mut events = manager.subscribe("busy").unwrap();

        let request = SyncRequest {
            sources: vec![src.path().to_path_buf()],
            dest_root: dst.path().to_path_buf(),
            workers: 1,
        };
        manager.start("busy", request).unwrap();
        // A lagged receiver means chunks are already flowing.
        loop {
            match events.recv().await {
                Ok(event) if event.phase != Phase::Downloading => continue,
                _ => break,
            }
        }

        assert_eq!(manager.shutdown().await, 1);
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(session.status().results.len(), 1);
        // Nothing left to wait for.
        assert_eq!(manager.shutdown().await, 0);
    }

    #[tokio::test]
    async fn test_start_unknown_session_is_rejected() {
        let manager = SessionManager::new(SessionOptions::default());
        let request = SyncRequest { sources: vec![], dest_root: "/tmp".into(), workers: 1 };
        assert!(matches!(manager.start("ghost", request), Err(SyncError::UnknownSession(_))));
    }
}
