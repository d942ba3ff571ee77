use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{DigestKind, RemoteClient, RemoteEntry, RemoteError, RemoteStore, ROOT_ID};

/// In-process store. Uploading a name that already exists in a folder
/// replaces that file, so repeated syncs converge instead of piling up copies.
/// Reports MD5 checksums unless built [`with_digest`](Self::with_digest).
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    reject_login: Option<String>,
    digest: DigestKind,
}

#[derive(Default)]
struct StoreState {
    next_id: u64,
    entries: HashMap<String, StoredEntry>,
    uploads: usize,
}

struct StoredEntry {
    parent_id: String,
    entry: RemoteEntry,
    content: Vec<u8>,
}

impl StoreState {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("obj-{}", self.next_id)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose login always fails with `reason`.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            reject_login: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn with_digest(digest: DigestKind) -> Self {
        Self {
            digest,
            ..Self::default()
        }
    }

    /// Number of upload calls served so far.
    pub fn upload_count(&self) -> usize {
        self.state.lock().uploads
    }

    pub fn content_of(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().entries.get(id).map(|e| e.content.clone())
    }

    fn client(&self) -> MemoryClient {
        MemoryClient {
            state: self.state.clone(),
            digest: self.digest,
        }
    }
}

impl RemoteStore for MemoryStore {
    fn authenticate(&self) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        match &self.reject_login {
            Some(reason) => Err(RemoteError::Auth(reason.clone())),
            None => Ok(Arc::new(self.client())),
        }
    }
}

struct MemoryClient {
    state: Arc<Mutex<StoreState>>,
    digest: DigestKind,
}

impl MemoryClient {
    fn check_parent(state: &StoreState, parent_id: &str) -> Result<(), RemoteError> {
        if parent_id == ROOT_ID {
            return Ok(());
        }
        match state.entries.get(parent_id) {
            Some(stored) if stored.entry.is_folder => Ok(()),
            _ => Err(RemoteError::NotFound(parent_id.to_string())),
        }
    }
}

impl RemoteClient for MemoryClient {
    fn digest_kind(&self) -> DigestKind {
        self.digest
    }

    fn list_children(&self, parent_id: &str, name_filter: Option<&str>) -> Result<Vec<RemoteEntry>, RemoteError> {
        let state = self.state.lock();
        Self::check_parent(&state, parent_id)?;
        let mut children: Vec<RemoteEntry> = state
            .entries
            .values()
            .filter(|s| s.parent_id == parent_id)
            .filter(|s| name_filter.map_or(true, |name| s.entry.name == name))
            .map(|s| s.entry.clone())
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    fn create_folder(&self, name: &str, parent_id: &str) -> Result<String, RemoteError> {
        let mut state = self.state.lock();
        Self::check_parent(&state, parent_id)?;
        let id = state.allocate_id();
        debug!("Creating folder {} ({}) under {}", name, id, parent_id);
        state.entries.insert(
            id.clone(),
            StoredEntry {
                parent_id: parent_id.to_string(),
                entry: RemoteEntry {
                    id: id.clone(),
                    name: name.to_string(),
                    size_bytes: 0,
                    content_digest: None,
                    is_folder: true,
                },
                content: Vec::new(),
            },
        );
        Ok(id)
    }

    fn upload_file(&self, local_path: &Path, parent_id: &str, display_name: &str) -> Result<String, RemoteError> {
        let content = fs::read(local_path)?;
        let digest = self.digest.digest_bytes(&content);

        let mut state = self.state.lock();
        Self::check_parent(&state, parent_id)?;
        state.uploads += 1;

        let existing = state
            .entries
            .iter()
            .find(|(_, s)| s.parent_id == parent_id && !s.entry.is_folder && s.entry.name == display_name)
            .map(|(id, _)| id.clone());
        let id = match existing {
            Some(id) => id,
            None => state.allocate_id(),
        };

        state.entries.insert(
            id.clone(),
            StoredEntry {
                parent_id: parent_id.to_string(),
                entry: RemoteEntry {
                    id: id.clone(),
                    name: display_name.to_string(),
                    size_bytes: content.len() as u64,
                    content_digest: Some(digest),
                    is_folder: false,
                },
                content,
            },
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_folders_and_uploads() {
        let store = MemoryStore::new();
        let client = store.authenticate().unwrap();
        let folder = client.create_folder("docs", ROOT_ID).unwrap();

        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"v1").unwrap();
        let first = client.upload_file(&file, &folder, "a.txt").unwrap();
        fs::write(&file, b"v2!").unwrap();
        let second = client.upload_file(&file, &folder, "a.txt").unwrap();

        assert_eq!(first, second);
        let children = client.list_children(&folder, None).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].size_bytes, 3);
        assert_eq!(children[0].content_digest, Some(DigestKind::Md5.digest_bytes(b"v2!")));
        assert_eq!(store.content_of(&first).unwrap(), b"v2!");
        assert_eq!(store.upload_count(), 2);

        let named = client.list_children(ROOT_ID, Some("docs")).unwrap();
        assert_eq!(named.len(), 1);
        assert!(named[0].is_folder);
        assert!(client.list_children(ROOT_ID, Some("other")).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let client = MemoryStore::new().authenticate().unwrap();
        assert!(matches!(client.create_folder("x", "nope"), Err(RemoteError::NotFound(_))));
    }

    #[test]
    fn test_rejecting_store() {
        let err = MemoryStore::rejecting("token expired").authenticate().err().unwrap();
        assert_eq!(err.to_string(), "authentication failed: token expired");
    }
}
