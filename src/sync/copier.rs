use super::progress::ProgressAggregator;
use super::{SyncTask, TransferResult};
use std::fs::{self, File, FileTimes};
use std::io::{self, Read, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Files at or above this size are streamed in chunks.
pub const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;
pub const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct CopyOptions {
    pub large_file_threshold: u64,
    pub chunk_size: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            large_file_threshold: LARGE_FILE_THRESHOLD,
            chunk_size: CHUNK_SIZE,
        }
    }
}

enum CopyOutcome {
    Completed,
    Cancelled,
}

/// Moves the bytes of one task into place.
///
/// Small files go in one shot and report a single progress delta. Large files
/// are streamed chunk by chunk, reporting each chunk and checking the
/// cancellation token before every read. A cancelled chunked copy leaves the
/// destination truncated; the size mismatch makes the next run copy it again.
#[derive(Debug, Clone, Default)]
pub struct ChunkedCopyEngine {
    options: CopyOptions,
}

impl ChunkedCopyEngine {
    pub fn new(options: CopyOptions) -> Self {
        Self { options }
    }

    pub fn copy(
        &self,
        task: &SyncTask,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> TransferResult {
        if cancel.is_cancelled() {
            return TransferResult::cancelled(&task.source_path);
        }

        match self.transfer(task, progress, cancel) {
            Ok(CopyOutcome::Completed) => {
                if let Err(e) = preserve_metadata(&task.source_path, &task.dest_path) {
                    debug!("Could not copy metadata to {}: {}", task.dest_path.display(), e);
                }
                TransferResult::updated(&task.source_path)
            }
            Ok(CopyOutcome::Cancelled) => {
                debug!("Copy of {} cancelled mid-file", task.source_path.display());
                TransferResult::cancelled(&task.source_path)
            }
            Err(e) => {
                warn!("Copy failed {} -> {}: {}", task.source_path.display(), task.dest_path.display(), e);
                TransferResult::error(&task.source_path, e)
            }
        }
    }

    fn transfer(
        &self,
        task: &SyncTask,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> io::Result<CopyOutcome> {
        if let Some(parent) = task.dest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if task.size_bytes >= self.options.large_file_threshold {
            return self.copy_chunked(task, progress, cancel);
        }

        fs::copy(&task.source_path, &task.dest_path)?;
        progress.advance(task.size_bytes, &task.item_name());
        Ok(CopyOutcome::Completed)
    }

    fn copy_chunked(
        &self,
        task: &SyncTask,
        progress: &ProgressAggregator,
        cancel: &CancellationToken,
    ) -> io::Result<CopyOutcome> {
        let name = task.item_name();
        let mut reader = File::open(&task.source_path)?;
        let mut writer = File::create(&task.dest_path)?;
        let mut buf = vec![0u8; self.options.chunk_size.max(1)];

        loop {
            if cancel.is_cancelled() {
                return Ok(CopyOutcome::Cancelled);
            }
            let n = read_chunk(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            progress.advance(n as u64, &name);
        }

        writer.flush()?;
        Ok(CopyOutcome::Completed)
    }
}

/// Fill `buf` as far as the file allows so every chunk but the last is full-size.
fn read_chunk(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Best effort: timestamps and permissions.
fn preserve_metadata(source: &Path, dest: &Path) -> io::Result<()> {
    let meta = fs::metadata(source)?;
    let times = FileTimes::new()
        .set_accessed(meta.accessed()?)
        .set_modified(meta.modified()?);
    // fs::copy may already have made the destination read-only.
    let file = fs::OpenOptions::new()
        .write(true)
        .open(dest)
        .or_else(|_| File::open(dest))?;
    file.set_times(times)?;
    drop(file);
    fs::set_permissions(dest, meta.permissions())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{Phase, TransferStatus};
    use tempfile::tempdir;

    fn task(src: &Path, dst: &Path) -> SyncTask {
        SyncTask {
            source_path: src.to_path_buf(),
            dest_path: dst.to_path_buf(),
            size_bytes: fs::metadata(src).unwrap().len(),
        }
    }

    #[test]
    fn test_small_file_single_delta() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        let dst = dir.path().join("out/nested/a.txt");
        fs::write(&src, b"hello").unwrap();

        let (progress, mut rx) = ProgressAggregator::channel("s");
        progress.set_total(5, 1);
        let result = ChunkedCopyEngine::default().copy(&task(&src, &dst), &progress, &CancellationToken::new());

        assert_eq!(result.status, TransferStatus::Updated);
        assert_eq!(fs::read(&dst).unwrap(), b"hello");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.phase, Phase::Downloading);
        assert_eq!(event.percent, 100);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_large_file_reports_each_chunk() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("big.bin");
        let dst = dir.path().join("copy/big.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
        fs::write(&src, &data).unwrap();

        let engine = ChunkedCopyEngine::new(CopyOptions { large_file_threshold: 1000, chunk_size: 1024 });
        let (progress, mut rx) = ProgressAggregator::channel("s");
        progress.set_total(data.len() as u64, 1);
        let result = engine.copy(&task(&src, &dst), &progress, &CancellationToken::new());

        assert_eq!(result.status, TransferStatus::Updated);
        assert_eq!(fs::read(&dst).unwrap(), data);
        let mut deltas = 0;
        while rx.try_recv().is_ok() {
            deltas += 1;
        }
        assert_eq!(deltas, 10);
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn test_cancelled_before_start_writes_nothing() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"abc").unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let (progress, _rx) = ProgressAggregator::channel("s");
        let result = ChunkedCopyEngine::default().copy(&task(&src, &dst), &progress, &token);

        assert_eq!(result.status, TransferStatus::Cancelled);
        assert!(!dst.exists());
    }

    #[test]
    fn test_missing_source_is_error() {
        let dir = tempdir().unwrap();
        let bogus = SyncTask {
            source_path: dir.path().join("gone"),
            dest_path: dir.path().join("out"),
            size_bytes: 4,
        };
        let (progress, _rx) = ProgressAggregator::channel("s");
        let result = ChunkedCopyEngine::default().copy(&bogus, &progress, &CancellationToken::new());
        assert_eq!(result.status, TransferStatus::Error);
        assert!(result.message.contains("gone"));
    }

    #[test]
    fn test_mtime_is_preserved() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"abc").unwrap();
        let old = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        fs::OpenOptions::new()
            .write(true)
            .open(&src)
            .unwrap()
            .set_times(FileTimes::new().set_modified(old))
            .unwrap();

        let (progress, _rx) = ProgressAggregator::channel("s");
        ChunkedCopyEngine::default().copy(&task(&src, &dst), &progress, &CancellationToken::new());
        assert_eq!(fs::metadata(&dst).unwrap().modified().unwrap(), old);
    }
}
