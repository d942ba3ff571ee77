//! Remote object-store target.
//!
//! The engine only needs four operations from a store: authenticate, list a
//! folder's children, create a folder and upload a file. Real backends (and
//! their browser-based login flows) live behind these traits.

pub mod memory;
pub mod sync;

pub use memory::MemoryStore;
pub use sync::{run_remote, RemoteRequest, RemoteTask, RemoteTaskProcessor};

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::sync::detector::{file_digest, HASH_BLOCK_SIZE};

/// Parent id that addresses the top of a store.
pub const ROOT_ID: &str = "root";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Checksum algorithm behind [`RemoteEntry::content_digest`]. Drive-style
/// stores report MD5.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    #[default]
    Md5,
    Blake3,
}

impl DigestKind {
    /// Lowercase hex digest of `data`.
    pub fn digest_bytes(self, data: &[u8]) -> String {
        match self {
            DigestKind::Md5 => format!("{:x}", md5::compute(data)),
            DigestKind::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }

    /// Lowercase hex digest of a local file, streamed.
    pub fn file_digest(self, path: &Path) -> io::Result<String> {
        match self {
            DigestKind::Blake3 => file_digest(path),
            DigestKind::Md5 => {
                let mut file = File::open(path)?;
                let mut context = md5::Context::new();
                let mut buf = vec![0u8; HASH_BLOCK_SIZE];
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    context.consume(&buf[..n]);
                }
                Ok(format!("{:x}", context.compute()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    /// Hex content digest as reported by the store, in the client's
    /// [`DigestKind`], when it has one.
    pub content_digest: Option<String>,
    pub is_folder: bool,
}

/// Something that can hand out a credentialed client.
pub trait RemoteStore: Send + Sync {
    fn authenticate(&self) -> Result<Arc<dyn RemoteClient>, RemoteError>;
}

/// Operations available once logged in.
pub trait RemoteClient: Send + Sync {
    /// Algorithm the store uses for `content_digest`.
    fn digest_kind(&self) -> DigestKind;

    /// Children of `parent_id`, optionally only those named exactly `name_filter`.
    fn list_children(&self, parent_id: &str, name_filter: Option<&str>) -> Result<Vec<RemoteEntry>, RemoteError>;

    fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, RemoteError>;

    fn upload_file(&self, local_path: &Path, parent_id: &str, display_name: &str) -> Result<String, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_md5_matches_drive_checksums() {
        assert_eq!(DigestKind::Md5.digest_bytes(b"hello"), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(DigestKind::Md5.digest_bytes(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_streamed_file_digest_matches_in_memory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        let data: Vec<u8> = (0..(HASH_BLOCK_SIZE * 2 + 5)).map(|i| (i % 13) as u8).collect();
        fs::write(&path, &data).unwrap();

        for kind in [DigestKind::Md5, DigestKind::Blake3] {
            assert_eq!(kind.file_digest(&path).unwrap(), kind.digest_bytes(&data));
        }
    }
}
