use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::copier::{ChunkedCopyEngine, CopyOptions};
use super::detector::{ChangeDetector, Decision};
use super::progress::ProgressAggregator;
use super::{SyncTask, TransferResult};

/// The unit of work a pool worker runs for one task.
/// Keeps the pool ignorant of what "syncing a file" means for a given target.
pub trait TaskProcessor: Send + Sync {
    type Task: Send;

    /// Must produce exactly one result and never panic across the boundary
    /// on ordinary I/O failure.
    fn process_task(
        &self,
        worker_id: usize,
        task: &Self::Task,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> TransferResult;

    /// Path reported for a task that never ran or blew up.
    fn task_path(&self, task: &Self::Task) -> PathBuf;
}

/// Local filesystem target: detect change, then copy.
#[derive(Debug, Clone, Default)]
pub struct LocalTaskProcessor {
    detector: ChangeDetector,
    engine: ChunkedCopyEngine,
}

impl LocalTaskProcessor {
    pub fn new(options: CopyOptions) -> Self {
        Self {
            detector: ChangeDetector::new(),
            engine: ChunkedCopyEngine::new(options),
        }
    }
}

impl TaskProcessor for LocalTaskProcessor {
    type Task = SyncTask;

    fn process_task(
        &self,
        worker_id: usize,
        task: &SyncTask,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> TransferResult {
        if cancel.is_cancelled() {
            return TransferResult::cancelled(&task.source_path);
        }

        match self.detector.check(&task.source_path, &task.dest_path, cancel) {
            Decision::Cancelled => TransferResult::cancelled(&task.source_path),
            Decision::Skip => {
                debug!("Worker {} skipping unchanged {}", worker_id, task.source_path.display());
                progress.advance(task.size_bytes, &format!("(Skipped) {}", task.item_name()));
                TransferResult::skipped(&task.source_path)
            }
            Decision::Copy => {
                debug!("Worker {} copying {}", worker_id, task.source_path.display());
                self.engine.copy(task, progress, cancel)
            }
        }
    }

    fn task_path(&self, task: &SyncTask) -> PathBuf {
        task.source_path.clone()
    }
}
