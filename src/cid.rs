//! Content-addressed id resolution
//!
//! A CID is resolved by asking the content store first and the local
//! filesystem second. Nothing is cached: every call goes back to the source.

use crate::details::Payload;
use crate::diagnostics::escape_html;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A stored record with named payload fields
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CidRecord {
    pub file_data: Option<Payload>,
    pub data: Option<Payload>,
}

/// What a content store returns for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredContent {
    Record(CidRecord),
    Raw(Payload),
}

impl StoredContent {
    /// `file_data`, else `data`, else the raw content itself
    pub fn into_payload(self) -> Option<Payload> {
        match self {
            StoredContent::Record(record) => record.file_data.or(record.data),
            StoredContent::Raw(payload) => Some(payload),
        }
    }
}

/// Content-addressed store consulted before the filesystem
pub trait ContentStore: Send + Sync {
    /// Look up a record by its normalized key (`/<cid>`)
    fn get(&self, key: &str) -> anyhow::Result<Option<StoredContent>>;
}

/// In-process content store keyed by `/<sha256-hex>`
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredContent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes under their content id and return the id
    pub fn put(&self, content: impl Into<Vec<u8>>) -> String {
        let content = content.into();
        let cid = content_id(&content);
        self.entries.write().insert(
            store_key(&cid),
            StoredContent::Record(CidRecord {
                file_data: Some(Payload::Bytes(content)),
                data: None,
            }),
        );
        cid
    }

    /// Store arbitrary content under an explicit key
    pub fn insert(&self, key: &str, content: StoredContent) {
        self.entries.write().insert(store_key(key), content);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ContentStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<StoredContent>> {
        Ok(self.entries.read().get(key).cloned())
    }
}

/// Lowercase hex SHA-256 of the content
pub fn content_id(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Normalize an id to a store key with exactly one leading `/`
pub fn store_key(id: &str) -> String {
    format!("/{}", id.trim().trim_start_matches('/'))
}

/// Normalize a CID reference for display and lookup (no leading `/`)
pub fn normalize_cid(reference: &str) -> String {
    reference.trim().trim_start_matches('/').to_string()
}

/// HTML link to a CID, with the id shortened for display
pub fn render_cid_link(key: &str) -> String {
    let cid = normalize_cid(key);
    let label = if cid.chars().count() > 12 {
        format!("{}...", cid.chars().take(12).collect::<String>())
    } else {
        cid.clone()
    };
    format!(
        "<a class=\"cid-link\" href=\"/{}\" title=\"{}\"><code>{}</code></a>",
        escape_html(&cid),
        escape_html(&cid),
        escape_html(&label)
    )
}

/// Resolves CIDs to text or bytes
#[derive(Clone)]
pub struct CidResolver {
    store: Arc<dyn ContentStore>,
    root: PathBuf,
}

impl CidResolver {
    /// `root` is the directory filesystem lookups are relative to
    pub fn new(store: Arc<dyn ContentStore>, root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    /// Resolve an id; `as_bytes` selects the returned representation
    pub fn resolve(&self, id: &str, as_bytes: bool) -> Option<Payload> {
        let payload = self.from_store(id).or_else(|| self.from_filesystem(id))?;
        Some(if as_bytes {
            Payload::Bytes(payload.into_bytes())
        } else {
            Payload::Text(payload.into_text())
        })
    }

    pub fn resolve_text(&self, id: &str) -> Option<String> {
        self.resolve(id, false).map(Payload::into_text)
    }

    pub fn resolve_bytes(&self, id: &str) -> Option<Vec<u8>> {
        self.resolve(id, true).map(Payload::into_bytes)
    }

    fn from_store(&self, id: &str) -> Option<Payload> {
        let key = store_key(id);
        match self.store.get(&key) {
            Ok(Some(content)) => content.into_payload(),
            Ok(None) => None,
            Err(e) => {
                debug!(key, error = %e, "Content store lookup failed");
                None
            }
        }
    }

    fn from_filesystem(&self, id: &str) -> Option<Payload> {
        let relative = Path::new(id.trim().trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || relative.components().any(|c| !matches!(c, Component::Normal(_)))
        {
            return None;
        }
        match std::fs::read(self.root.join(relative)) {
            Ok(bytes) => Some(Payload::Bytes(bytes)),
            Err(e) => {
                debug!(id, error = %e, "Filesystem CID lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingStore;

    impl ContentStore for FailingStore {
        fn get(&self, _key: &str) -> anyhow::Result<Option<StoredContent>> {
            anyhow::bail!("store offline")
        }
    }

    #[test]
    fn test_store_key_single_slash() {
        assert_eq!(store_key("abc"), "/abc");
        assert_eq!(store_key("/abc"), "/abc");
        assert_eq!(store_key("//abc"), "/abc");
        assert_eq!(normalize_cid(" /abc "), "abc");
    }

    #[test]
    fn test_put_is_content_addressed() {
        let store = MemoryStore::new();
        let a = store.put("hello");
        let b = store.put("hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_resolve_from_store() {
        let store = Arc::new(MemoryStore::new());
        let cid = store.put("source text");
        let resolver = CidResolver::new(store, "/nonexistent");

        assert_eq!(resolver.resolve_text(&cid).unwrap(), "source text");
        assert_eq!(resolver.resolve_bytes(&format!("/{}", cid)).unwrap(), b"source text");
    }

    #[test]
    fn test_record_field_precedence() {
        let store = Arc::new(MemoryStore::new());
        store.insert(
            "both",
            StoredContent::Record(CidRecord {
                file_data: Some(Payload::Text("file".to_string())),
                data: Some(Payload::Text("data".to_string())),
            }),
        );
        store.insert(
            "data-only",
            StoredContent::Record(CidRecord {
                file_data: None,
                data: Some(Payload::Bytes(b"data".to_vec())),
            }),
        );
        store.insert("raw", StoredContent::Raw(Payload::Text("raw".to_string())));
        let resolver = CidResolver::new(store, "/nonexistent");

        assert_eq!(resolver.resolve_text("both").unwrap(), "file");
        assert_eq!(resolver.resolve_text("data-only").unwrap(), "data");
        assert_eq!(resolver.resolve_text("raw").unwrap(), "raw");
    }

    #[test]
    fn test_empty_record_falls_back_to_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty"), "from disk").unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("empty", StoredContent::Record(CidRecord::default()));

        let resolver = CidResolver::new(store, dir.path());
        assert_eq!(resolver.resolve_text("/empty").unwrap(), "from disk");
    }

    #[test]
    fn test_store_errors_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("abc"), [0xff, 0x41]).unwrap();
        let resolver = CidResolver::new(Arc::new(FailingStore), dir.path());

        assert_eq!(resolver.resolve_bytes("/abc").unwrap(), vec![0xff, 0x41]);
        assert_eq!(resolver.resolve_text("abc").unwrap(), "\u{fffd}A");
        assert!(resolver.resolve("missing", false).is_none());
    }

    #[test]
    fn test_every_resolve_reads_the_source_again() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page"), "first").unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("entry", StoredContent::Raw(Payload::Text("v1".to_string())));
        let resolver = CidResolver::new(Arc::clone(&store) as _, dir.path());

        assert_eq!(resolver.resolve_text("entry").unwrap(), "v1");
        assert_eq!(resolver.resolve_text("page").unwrap(), "first");

        store.insert("entry", StoredContent::Raw(Payload::Text("v2".to_string())));
        std::fs::write(dir.path().join("page"), "second").unwrap();

        assert_eq!(resolver.resolve_text("entry").unwrap(), "v2");
        assert_eq!(resolver.resolve_text("page").unwrap(), "second");

        std::fs::remove_file(dir.path().join("page")).unwrap();
        assert!(resolver.resolve_text("page").is_none());
    }

    #[test]
    fn test_filesystem_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = CidResolver::new(Arc::new(MemoryStore::new()), dir.path().join("sub"));
        std::fs::write(dir.path().join("secret"), "x").unwrap();

        assert!(resolver.resolve_text("../secret").is_none());
        assert!(resolver.resolve_text("").is_none());
    }

    #[test]
    fn test_render_cid_link() {
        let link = render_cid_link("/0123456789abcdef");
        assert!(link.contains("href=\"/0123456789abcdef\""));
        assert!(link.contains("<code>0123456789ab...</code>"));
        assert!(render_cid_link("short").contains("<code>short</code>"));
    }
}
