//! Process-wide cache of local blob handles.
//!
//! A blob handle (`blob:<uuid>`) stands in for a URL while a file only exists
//! in memory. Handles are registered when a local resource is built and
//! revoked once, when a newer resource stops referencing them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use bytes::Bytes;
use uuid::Uuid;

pub const BLOB_SCHEME: &str = "blob:";

pub fn is_blob_handle(src: &str) -> bool {
    src.starts_with(BLOB_SCHEME)
}

#[derive(Debug, Clone, Default)]
pub struct BlobCache {
    entries: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl BlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, data: Bytes) -> String {
        let handle = format!("{}{}", BLOB_SCHEME, Uuid::new_v4());
        self.lock().insert(handle.clone(), data);
        handle
    }

    pub fn get(&self, handle: &str) -> Option<Bytes> {
        self.lock().get(handle).cloned()
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.lock().contains_key(handle)
    }

    /// Returns `false` for handles that are unknown or already revoked.
    pub fn revoke(&self, handle: &str) -> bool {
        if !is_blob_handle(handle) {
            return false;
        }

        self.lock().remove(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bytes>> {
        // The map stays consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_get() {
        let cache = BlobCache::new();
        let handle = cache.register(Bytes::from_static(b"frame"));

        assert!(is_blob_handle(&handle));
        assert_eq!(cache.get(&handle), Some(Bytes::from_static(b"frame")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_revoke_only_once() {
        let cache = BlobCache::new();
        let handle = cache.register(Bytes::from_static(b"data"));

        assert!(cache.revoke(&handle));
        assert!(!cache.revoke(&handle));
        assert!(cache.get(&handle).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_revoke_ignores_remote_urls() {
        let cache = BlobCache::new();
        cache.register(Bytes::from_static(b"data"));

        assert!(!cache.revoke("https://cdn.example.com/a.png"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = BlobCache::new();
        let other = cache.clone();
        let handle = other.register(Bytes::from_static(b"shared"));

        assert!(cache.contains(&handle));
    }
}
