use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use crate::types::{ItemId, ItemState, QueueItem};

/// Caller-supplied completion hooks for a queued item.
///
/// Each hook runs at most once per item, on the queue worker, so
/// implementations should return quickly.
pub trait UploadCallback: Send + Sync {
    /// Item entered `UPLOADING`
    fn on_upload_start(&self, _item: &QueueItem) {}

    /// Item's file was replaced by a transcoded one
    fn on_upload_progress(&self, _item: &QueueItem) {}

    /// Item was cancelled after a transcode or upload failure
    fn on_upload_error(&self, _item: &QueueItem, _error: &str) {}

    /// Item reached `UPLOADED`
    fn on_upload_success(&self, _item: &QueueItem) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadHook {
    Start,
    Progress,
    Error,
    Success,
}

impl UploadHook {
    /// Hook fired when an item enters `state`.
    pub fn for_state(state: ItemState) -> Option<Self> {
        match state {
            ItemState::Uploading => Some(UploadHook::Start),
            ItemState::Transcoded => Some(UploadHook::Progress),
            ItemState::Cancelled => Some(UploadHook::Error),
            ItemState::Uploaded => Some(UploadHook::Success),
            ItemState::Pending | ItemState::Transcoding => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FiredHooks {
    start: bool,
    progress: bool,
    error: bool,
    success: bool,
}

impl FiredHooks {
    /// Marks `hook` fired, returning whether it was still pending.
    fn take(&mut self, hook: UploadHook) -> bool {
        let flag = match hook {
            UploadHook::Start => &mut self.start,
            UploadHook::Progress => &mut self.progress,
            UploadHook::Error => &mut self.error,
            UploadHook::Success => &mut self.success,
        };

        !std::mem::replace(flag, true)
    }
}

struct HandlerEntry {
    callback: Arc<dyn UploadCallback>,
    fired: FiredHooks,
}

/// Handlers keyed by item id, kept apart from the items so those stay plain data.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<ItemId, HandlerEntry>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("items", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ItemId, callback: Arc<dyn UploadCallback>) {
        self.entries.insert(id, HandlerEntry {
            callback,
            fired: FiredHooks::default(),
        });
    }

    pub fn remove(&mut self, id: ItemId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: ItemId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Runs `hook` for the item unless it already ran. Returns whether it ran.
    pub fn fire(&mut self, hook: UploadHook, item: &QueueItem) -> bool {
        let Some(entry) = self.entries.get_mut(&item.id) else {
            return false;
        };

        if !entry.fired.take(hook) {
            return false;
        }

        match hook {
            UploadHook::Start => entry.callback.on_upload_start(item),
            UploadHook::Progress => entry.callback.on_upload_progress(item),
            UploadHook::Error => {
                let error = item.error.as_deref().unwrap_or("unknown error");
                entry.callback.on_upload_error(item, error)
            }
            UploadHook::Success => entry.callback.on_upload_success(item),
        }

        true
    }
}
