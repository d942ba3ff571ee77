use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Block size used when streaming files through the hasher.
pub const HASH_BLOCK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Copy,
    Skip,
    Cancelled,
}

/// Decides whether a destination file is stale, cheapest check first.
///
/// 1. destination missing
/// 2. sizes differ
/// 3. source mtime (whole seconds) newer than destination
/// 4. content digests differ
///
/// A destination that is newer than its source is never considered stale on
/// timestamps alone; only a digest mismatch will trigger a copy then.
/// Any I/O error answers "copy".
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    block_size: usize,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self { block_size: HASH_BLOCK_SIZE }
    }
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn needs_update(&self, source: &Path, dest: &Path) -> bool {
        self.check(source, dest, &CancellationToken::new()) == Decision::Copy
    }

    /// Same as [`needs_update`](Self::needs_update) but gives up before
    /// hashing if the run has been cancelled.
    pub fn check(&self, source: &Path, dest: &Path, cancel: &CancellationToken) -> Decision {
        let dest_meta = match fs::metadata(dest) {
            Ok(meta) => meta,
            Err(_) => return Decision::Copy,
        };
        let source_meta = match fs::metadata(source) {
            Ok(meta) => meta,
            Err(_) => return Decision::Copy,
        };

        if source_meta.len() != dest_meta.len() {
            debug!("Size differs: {} ({} vs {})", source.display(), source_meta.len(), dest_meta.len());
            return Decision::Copy;
        }

        match (mtime_secs(&source_meta), mtime_secs(&dest_meta)) {
            (Ok(src), Ok(dst)) if src > dst => {
                debug!("Source newer: {} ({} > {})", source.display(), src, dst);
                return Decision::Copy;
            }
            (Ok(_), Ok(_)) => {}
            _ => return Decision::Copy,
        }

        if cancel.is_cancelled() {
            return Decision::Cancelled;
        }

        match (self.digest(source), self.digest(dest)) {
            (Ok(a), Ok(b)) if a == b => Decision::Skip,
            (Ok(_), Ok(_)) => {
                debug!("Content differs: {}", source.display());
                Decision::Copy
            }
            _ => Decision::Copy,
        }
    }

    pub fn digest(&self, path: &Path) -> io::Result<String> {
        let mut file = File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; self.block_size];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// BLAKE3 hex digest of a file, streamed in 64 KiB blocks.
pub fn file_digest(path: &Path) -> io::Result<String> {
    ChangeDetector::default().digest(path)
}

fn mtime_secs(meta: &Metadata) -> io::Result<i64> {
    let modified = meta.modified()?;
    Ok(match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::FileTimes;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn set_mtime(path: &Path, time: SystemTime) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_modified(time)).unwrap();
    }

    #[test]
    fn test_missing_destination_needs_update() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        fs::write(&src, b"data").unwrap();
        assert!(ChangeDetector::new().needs_update(&src, &dir.path().join("nope")));
    }

    #[test]
    fn test_size_difference_wins_over_timestamps() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"short").unwrap();
        fs::write(&dst, b"much longer").unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&src, base);
        set_mtime(&dst, base + Duration::from_secs(600));
        assert!(ChangeDetector::new().needs_update(&src, &dst));
    }

    #[test]
    fn test_newer_source_needs_update() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"same").unwrap();
        fs::write(&dst, b"same").unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&dst, base);
        set_mtime(&src, base + Duration::from_secs(5));
        assert!(ChangeDetector::new().needs_update(&src, &dst));
    }

    #[test]
    fn test_identical_content_is_skipped() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"same bytes").unwrap();
        fs::write(&dst, b"same bytes").unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&src, base);
        set_mtime(&dst, base);
        assert!(!ChangeDetector::new().needs_update(&src, &dst));
    }

    #[test]
    fn test_newer_destination_with_different_content_is_copied() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"aaaa").unwrap();
        fs::write(&dst, b"bbbb").unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&src, base);
        set_mtime(&dst, base + Duration::from_secs(60));
        // Timestamps say "keep", the digest still catches the difference.
        assert!(ChangeDetector::new().needs_update(&src, &dst));
    }

    #[test]
    fn test_cancelled_before_hashing() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        fs::write(&src, b"same").unwrap();
        fs::write(&dst, b"same").unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&src, base);
        set_mtime(&dst, base);

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(ChangeDetector::new().check(&src, &dst, &token), Decision::Cancelled);
    }

    #[test]
    fn test_digest_spans_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big");
        let data: Vec<u8> = (0..(HASH_BLOCK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();
        assert_eq!(file_digest(&path).unwrap(), blake3::hash(&data).to_hex().to_string());
    }
}
