use super::{SyncTask, TransferResult};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Tasks discovered for one run, plus a result for every entry that did not
/// become a task (unreadable, or not something that can be copied).
#[derive(Debug, Default)]
pub struct Enumeration {
    pub tasks: Vec<SyncTask>,
    pub total_bytes: u64,
    pub unprocessed: Vec<TransferResult>,
}

/// What a walked non-directory entry turns into.
pub(crate) enum EntryKind {
    File(u64),
    PassOver(&'static str),
    Unreadable(io::Error),
}

/// Symlinks are followed to regular files only; linked directories are not
/// descended, so the walk cannot loop.
pub(crate) fn classify(entry: &DirEntry) -> EntryKind {
    let file_type = entry.file_type();
    if file_type.is_file() {
        return match entry.metadata() {
            Ok(meta) => EntryKind::File(meta.len()),
            Err(e) => EntryKind::Unreadable(e.into()),
        };
    }
    if !file_type.is_symlink() {
        return EntryKind::PassOver("not a regular file");
    }
    match fs::metadata(entry.path()) {
        Ok(meta) if meta.is_file() => EntryKind::File(meta.len()),
        Ok(meta) if meta.is_dir() => EntryKind::PassOver("link to a directory is not followed"),
        Ok(_) => EntryKind::PassOver("link to something other than a regular file"),
        Err(e) => EntryKind::Unreadable(e),
    }
}

impl Enumeration {
    fn push(&mut self, task: SyncTask) {
        self.total_bytes += task.size_bytes;
        self.tasks.push(task);
    }
}

/// Walks sources and maps every file onto its place under the destination root.
///
/// A file source lands at `dest_root/<name>`; a directory source is mirrored
/// under `dest_root/<dir name>/...`. Destination directories are not created here.
pub struct PathEnumerator {
    dest_root: PathBuf,
}

impl PathEnumerator {
    pub fn new(dest_root: impl Into<PathBuf>) -> Self {
        Self { dest_root: dest_root.into() }
    }

    pub fn enumerate(&self, sources: &[PathBuf]) -> Enumeration {
        let mut enumeration = Enumeration::default();
        for source in sources {
            self.enumerate_source(source, &mut enumeration);
        }
        info!(
            "Enumerated {} files ({} bytes), {} other entries",
            enumeration.tasks.len(),
            enumeration.total_bytes,
            enumeration.unprocessed.len()
        );
        enumeration
    }

    fn enumerate_source(&self, source: &Path, out: &mut Enumeration) {
        let source = match fs::canonicalize(source) {
            Ok(path) => path,
            Err(e) => {
                warn!("Source does not exist: {} ({})", source.display(), e);
                out.unprocessed.push(TransferResult::error(source, format!("source does not exist: {}", e)));
                return;
            }
        };
        let basename = source.file_name().map(PathBuf::from).unwrap_or_default();

        if source.is_file() {
            match fs::metadata(&source) {
                Ok(meta) => out.push(SyncTask {
                    dest_path: self.dest_root.join(&basename),
                    source_path: source,
                    size_bytes: meta.len(),
                }),
                Err(e) => out.unprocessed.push(TransferResult::error(&source, e)),
            }
        } else if source.is_dir() {
            let dest_dir = self.dest_root.join(&basename);
            self.walk_directory(&source, &dest_dir, out);
        } else {
            warn!("Skipping invalid source path: {}", source.display());
            out.unprocessed.push(TransferResult::error(&source, "not a regular file or directory"));
        }
    }

    fn walk_directory(&self, source: &Path, dest_dir: &Path, out: &mut Enumeration) {
        for entry in WalkDir::new(source).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
                    warn!("Unreadable entry {}: {}", path.display(), e);
                    out.unprocessed.push(TransferResult::error(path, e));
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }

            let relative = match entry.path().strip_prefix(source) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            match classify(&entry) {
                EntryKind::File(size_bytes) => {
                    debug!("Found {} ({} bytes)", entry.path().display(), size_bytes);
                    out.push(SyncTask {
                        source_path: entry.path().to_path_buf(),
                        dest_path: dest_dir.join(relative),
                        size_bytes,
                    });
                }
                EntryKind::PassOver(reason) => {
                    debug!("Passing over {}: {}", entry.path().display(), reason);
                    out.unprocessed.push(TransferResult::passed_over(entry.path(), reason));
                }
                EntryKind::Unreadable(e) => {
                    warn!("Cannot stat {}: {}", entry.path().display(), e);
                    out.unprocessed.push(TransferResult::error(entry.path(), e));
                }
            }
        }
    }
}
