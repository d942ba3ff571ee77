use crossbeam_channel::{bounded, Receiver};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::progress::ProgressAggregator;
use super::task_processor::TaskProcessor;
use super::TransferResult;

/// Bounded worker pool for one run.
///
/// Tasks go out over a bounded channel (backpressure keeps the dispatcher at
/// most two tasks per worker ahead). Once the cancellation token fires the
/// dispatcher stops handing out work and records every remaining task as
/// cancelled; work already handed out is awaited, so every task ends up with
/// exactly one result in the aggregator.
pub struct TaskManager {
    num_workers: usize,
}

#[derive(Debug)]
pub enum WorkItem<T> {
    Task(T),
    Shutdown,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TaskManagerStatus {
    pub dispatched_tasks: usize,
    pub undispatched_tasks: usize,
    pub duration_ms: u64,
}

impl TaskManager {
    pub fn new(num_workers: usize) -> Self {
        Self { num_workers: num_workers.max(1) }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Run every task to a result. Blocks until the pool has drained.
    pub fn run<P: TaskProcessor>(
        &self,
        processor: &P,
        tasks: Vec<P::Task>,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> TaskManagerStatus {
        info!("Starting task manager with {} workers for {} tasks", self.num_workers, tasks.len());
        let start = Instant::now();
        let mut status = TaskManagerStatus::default();
        let (work_sender, work_receiver) = bounded::<WorkItem<P::Task>>(self.num_workers * 2);

        thread::scope(|scope| {
            for worker_id in 0..self.num_workers {
                let work_receiver = work_receiver.clone();
                scope.spawn(move || worker_loop(worker_id, work_receiver, processor, progress, cancel));
            }
            drop(work_receiver);

            for task in tasks {
                if cancel.is_cancelled() {
                    progress.record(TransferResult::cancelled(processor.task_path(&task)));
                    status.undispatched_tasks += 1;
                    continue;
                }
                match work_sender.send(WorkItem::Task(task)) {
                    Ok(()) => status.dispatched_tasks += 1,
                    Err(err) => {
                        // Every worker is gone; nothing left to run it.
                        if let WorkItem::Task(task) = err.into_inner() {
                            warn!("No workers left for {}", processor.task_path(&task).display());
                            progress.record(TransferResult::cancelled(processor.task_path(&task)));
                            status.undispatched_tasks += 1;
                        }
                    }
                }
            }

            for _ in 0..self.num_workers {
                let _ = work_sender.send(WorkItem::Shutdown);
            }
        });

        status.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Task manager drained: {} dispatched, {} never dispatched, {} ms",
            status.dispatched_tasks, status.undispatched_tasks, status.duration_ms
        );
        status
    }
}

/// Worker loop - one per OS thread
fn worker_loop<P: TaskProcessor>(
    worker_id: usize,
    work_receiver: Receiver<WorkItem<P::Task>>,
    processor: &P,
    progress: &ProgressAggregator,
    cancel: &CancellationToken,
) {
    debug!("Worker {} started", worker_id);

    loop {
        match work_receiver.recv() {
            Ok(WorkItem::Task(task)) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    processor.process_task(worker_id, &task, progress, cancel)
                }))
                .unwrap_or_else(|_| {
                    warn!("Worker {} panicked on {}", worker_id, processor.task_path(&task).display());
                    TransferResult::error(processor.task_path(&task), "worker panicked")
                });
                progress.record(result);
            }
            Ok(WorkItem::Shutdown) => {
                debug!("Worker {} shutting down", worker_id);
                break;
            }
            Err(_) => {
                debug!("Worker {} channel closed", worker_id);
                break;
            }
        }
    }
}
