use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{RemoteClient, RemoteEntry, RemoteError, ROOT_ID};
use crate::sync::progress::ProgressAggregator;
use crate::sync::scanner::{classify, EntryKind};
use crate::sync::task_manager::TaskManager;
use crate::sync::task_processor::TaskProcessor;
use crate::sync::{item_name, resolve_terminal, Phase, RunOutcome, TerminalPhase, TransferResult};

/// Upload a local directory into a same-named folder on the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub source: PathBuf,
    #[serde(default)]
    pub workers: usize,
    /// Where the top folder goes; the store root when absent.
    #[serde(default)]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteTask {
    pub source_path: PathBuf,
    pub parent_id: String,
    pub display_name: String,
    pub size_bytes: u64,
    /// Same-named file already present in the target folder.
    pub existing: Option<RemoteEntry>,
}

#[derive(Debug, Default)]
pub struct UploadPlan {
    /// Store id of the top folder the tree is uploaded into.
    pub folder_id: String,
    pub tasks: Vec<RemoteTask>,
    pub total_bytes: u64,
    /// Results for entries that did not become tasks.
    pub unprocessed: Vec<TransferResult>,
}

struct FolderListing {
    id: String,
    files: HashMap<String, RemoteEntry>,
    folders: HashMap<String, String>,
}

fn list_folder(client: &dyn RemoteClient, id: String) -> Result<FolderListing, RemoteError> {
    let mut files = HashMap::new();
    let mut folders = HashMap::new();
    for entry in client.list_children(&id, None)? {
        if entry.is_folder {
            folders.insert(entry.name, entry.id);
        } else {
            files.insert(entry.name.clone(), entry);
        }
    }
    Ok(FolderListing { id, files, folders })
}

/// Reuse the first folder named `name` under `parent_id`, or create it.
fn ensure_folder(client: &dyn RemoteClient, name: &str, parent_id: &str) -> Result<String, RemoteError> {
    let existing = client
        .list_children(parent_id, Some(name))?
        .into_iter()
        .find(|e| e.is_folder);
    match existing {
        Some(folder) => {
            debug!("Found existing folder '{}' ({})", name, folder.id);
            Ok(folder.id)
        }
        None => {
            info!("Creating folder '{}' under {}", name, parent_id);
            client.create_folder(name, parent_id)
        }
    }
}

/// Resolve the remote folder tree for `source` and build one task per file.
///
/// Folder lookups and creations happen here, sequentially, so workers never
/// race to create the same folder. Each remote folder is listed once.
pub fn plan_upload(
    client: &dyn RemoteClient,
    source: &Path,
    parent_id: &str,
    progress: &ProgressAggregator,
) -> Result<UploadPlan, RemoteError> {
    let folder_name = item_name(source);
    progress.publish(Phase::Status, "", Some("Finding destination folder...".to_string()));
    let folder_id = ensure_folder(client, &folder_name, parent_id)?;
    progress.publish(Phase::Status, "", Some("Checking for existing files...".to_string()));

    let mut plan = UploadPlan { folder_id: folder_id.clone(), ..Default::default() };
    let mut listings: HashMap<PathBuf, FolderListing> = HashMap::new();
    listings.insert(PathBuf::new(), list_folder(client, folder_id)?);

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
                plan.unprocessed.push(TransferResult::error(path, e));
                continue;
            }
        };
        let relative = match entry.path().strip_prefix(source) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let parent_rel = relative.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = entry.file_name().to_string_lossy().to_string();

        // A parent that failed to resolve was already reported.
        let Some(parent) = listings.get(&parent_rel) else {
            continue;
        };

        if entry.file_type().is_dir() {
            let resolved = match parent.folders.get(&name) {
                Some(id) => Ok(id.clone()),
                None => client.create_folder(&name, &parent.id),
            }
            .and_then(|id| list_folder(client, id));
            match resolved {
                Ok(listing) => {
                    listings.insert(relative, listing);
                }
                Err(e) => {
                    warn!("Cannot resolve remote folder for {}: {}", entry.path().display(), e);
                    plan.unprocessed.push(TransferResult::error(entry.path(), e));
                }
            }
        } else {
            match classify(&entry) {
                EntryKind::File(size_bytes) => {
                    plan.total_bytes += size_bytes;
                    plan.tasks.push(RemoteTask {
                        source_path: entry.path().to_path_buf(),
                        parent_id: parent.id.clone(),
                        existing: parent.files.get(&name).cloned(),
                        display_name: name,
                        size_bytes,
                    });
                }
                EntryKind::PassOver(reason) => {
                    debug!("Passing over {}: {}", entry.path().display(), reason);
                    plan.unprocessed.push(TransferResult::passed_over(entry.path(), reason));
                }
                EntryKind::Unreadable(e) => plan.unprocessed.push(TransferResult::error(entry.path(), e)),
            }
        }
    }

    Ok(plan)
}

/// Skip when the store already holds a file of the same size and digest,
/// otherwise upload it.
pub struct RemoteTaskProcessor {
    client: Arc<dyn RemoteClient>,
}

impl RemoteTaskProcessor {
    pub fn new(client: Arc<dyn RemoteClient>) -> Self {
        Self { client }
    }

    fn is_current(&self, task: &RemoteTask, cancel: &CancellationToken) -> Option<bool> {
        let existing = match &task.existing {
            Some(existing) if existing.size_bytes == task.size_bytes => existing,
            _ => return Some(false),
        };
        let Some(remote_digest) = &existing.content_digest else {
            return Some(false);
        };
        if cancel.is_cancelled() {
            return None;
        }
        // An unreadable local file falls through to an upload attempt.
        let local = self.client.digest_kind().file_digest(&task.source_path);
        Some(local.map_or(false, |local| local.eq_ignore_ascii_case(remote_digest)))
    }
}

impl TaskProcessor for RemoteTaskProcessor {
    type Task = RemoteTask;

    fn process_task(
        &self,
        worker_id: usize,
        task: &RemoteTask,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> TransferResult {
        if cancel.is_cancelled() {
            return TransferResult::cancelled(&task.source_path);
        }

        match self.is_current(task, cancel) {
            None => return TransferResult::cancelled(&task.source_path),
            Some(true) => {
                debug!("Worker {} skipping {}", worker_id, task.display_name);
                progress.advance(task.size_bytes, &format!("(Skipped) {}", task.display_name));
                return TransferResult::skipped(&task.source_path);
            }
            Some(false) => {}
        }

        match self.client.upload_file(&task.source_path, &task.parent_id, &task.display_name) {
            Ok(id) => {
                debug!("Worker {} uploaded {} as {}", worker_id, task.display_name, id);
                progress.advance(task.size_bytes, &task.display_name);
                TransferResult::updated(&task.source_path)
            }
            Err(e) => {
                warn!("Upload failed for {}: {}", task.source_path.display(), e);
                TransferResult::error(&task.source_path, e)
            }
        }
    }

    fn task_path(&self, task: &RemoteTask) -> PathBuf {
        task.source_path.clone()
    }
}

/// One remote run, up to but not including the terminal event.
/// Every outcome, including a failed folder resolution, lands in `progress`.
/// On success the outcome carries the id of the folder the tree went into.
pub fn run_remote(
    request: &RemoteRequest,
    client: Arc<dyn RemoteClient>,
    workers: usize,
    progress: &ProgressAggregator,
    cancel: &CancellationToken,
) -> RunOutcome {
    let source = match std::fs::canonicalize(&request.source) {
        Ok(path) if path.is_dir() => path,
        _ => {
            progress.record(TransferResult::error(
                &request.source,
                "source must be a folder for remote upload",
            ));
            return TerminalPhase::Error.into();
        }
    };

    let parent_id = request.parent_id.as_deref().unwrap_or(ROOT_ID);
    let plan = match plan_upload(client.as_ref(), &source, parent_id, progress) {
        Ok(plan) => plan,
        Err(e) => {
            warn!("Remote folder resolution failed: {}", e);
            progress.record(TransferResult::error(&source, e));
            return TerminalPhase::Error.into();
        }
    };

    progress.set_total(plan.total_bytes, plan.tasks.len());
    for result in plan.unprocessed {
        progress.record(result);
    }
    progress.publish(
        Phase::Status,
        "",
        Some(format!("Found {} files ({} bytes)", plan.tasks.len(), plan.total_bytes)),
    );

    let processor = RemoteTaskProcessor::new(client);
    TaskManager::new(workers).run(&processor, plan.tasks, progress, cancel);
    info!("Remote run into folder {} drained", plan.folder_id);
    RunOutcome {
        phase: resolve_terminal(&progress.snapshot().results, cancel.is_cancelled()),
        folder_id: Some(plan.folder_id),
    }
}
