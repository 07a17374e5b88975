use chrono::Utc;
use crate::blob::is_blob_handle;
use crate::errors::{MediaQueueError, Result};
use crate::types::{AdditionalData, ItemId, ItemState, MediaFile, QueueItem, Resource, Stage};
use crate::upload::{resource_from_attachment, Attachment};

/// Result of a store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub id: ItemId,
    pub from: ItemState,
    pub to: ItemState,
    /// Blob handles the item no longer references. The caller revokes them.
    pub superseded: Vec<String>,
    pub resource_changed: bool,
}

impl Change {
    fn unchanged(id: ItemId, state: ItemState) -> Self {
        Self {
            id,
            from: state,
            to: state,
            superseded: Vec::new(),
            resource_changed: false,
        }
    }

    pub fn state_changed(&self) -> bool {
        self.from != self.to
    }

    pub fn is_noop(&self) -> bool {
        !self.state_changed() && !self.resource_changed
    }
}

/// Store operations as data, so pipelines can hand them to the queue worker.
#[derive(Debug, Clone)]
pub enum QueueOp {
    StartTranscoding,
    FinishTranscoding {
        file: MediaFile,
        additional_data: AdditionalData,
    },
    StartUploading,
    /// Maps the attachment against the resource current at commit time, then finishes the upload
    CompleteUpload {
        attachment: Attachment,
    },
    CancelUploading {
        stage: Stage,
        error: String,
    },
    ReplacePlaceholderResource {
        resource: Resource,
    },
}

/// Ordered collection of queue items. Every mutation goes through one of the
/// transition functions below; none of them touch anything but the items.
#[derive(Debug, Default)]
pub struct QueueStore {
    items: Vec<QueueItem>,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_item(
        &mut self,
        file: MediaFile,
        resource: Resource,
        additional_data: AdditionalData,
    ) -> ItemId {
        let item = QueueItem::new(file, resource, additional_data);
        let id = item.id;
        self.items.push(item);
        id
    }

    pub fn start_uploading(&mut self, id: ItemId) -> Result<Change> {
        let (_, from) = self.transition(id, "start uploading", ItemState::Uploading)?;

        Ok(Change {
            id,
            from,
            to: ItemState::Uploading,
            superseded: Vec::new(),
            resource_changed: false,
        })
    }

    pub fn finish_uploading(&mut self, id: ItemId, mut resource: Resource) -> Result<Change> {
        let (item, from) = self.transition(id, "finish uploading", ItemState::Uploaded)?;

        resource.id = Some(id);
        resource.is_placeholder = false;
        resource.is_transcoding = false;

        let superseded = superseded_handles(&item.resource, &resource);
        item.resource = resource;

        Ok(Change {
            id,
            from,
            to: ItemState::Uploaded,
            superseded,
            resource_changed: true,
        })
    }

    pub fn cancel_uploading(&mut self, id: ItemId, error: impl Into<String>) -> Result<Change> {
        let (item, from) = self.transition(id, "cancel", ItemState::Cancelled)?;
        item.error = Some(error.into());

        let resource_changed = item.resource.is_transcoding;
        item.resource.is_transcoding = false;

        Ok(Change {
            id,
            from,
            to: ItemState::Cancelled,
            superseded: Vec::new(),
            resource_changed,
        })
    }

    pub fn start_transcoding(&mut self, id: ItemId) -> Result<Change> {
        let (item, from) = self.transition(id, "start transcoding", ItemState::Transcoding)?;
        item.resource.is_transcoding = true;

        Ok(Change {
            id,
            from,
            to: ItemState::Transcoding,
            superseded: Vec::new(),
            resource_changed: true,
        })
    }

    pub fn finish_transcoding(&mut self, id: ItemId, file: MediaFile) -> Result<Change> {
        let (item, from) = self.transition(id, "finish transcoding", ItemState::Transcoded)?;
        item.file = file;
        item.resource.is_transcoding = false;

        Ok(Change {
            id,
            from,
            to: ItemState::Transcoded,
            superseded: Vec::new(),
            resource_changed: true,
        })
    }

    pub fn merge_additional_data(
        &mut self,
        id: ItemId,
        additional_data: AdditionalData,
    ) -> Result<()> {
        let item = self.get_mut(id)?;
        if item.state.is_terminal() {
            return Err(MediaQueueError::InvalidTransition {
                id,
                from: item.state,
                op: "merge additional data",
            });
        }

        item.additional_data.extend(additional_data);
        Ok(())
    }

    /// No-op unless the item still shows a placeholder.
    pub fn replace_placeholder_resource(
        &mut self,
        id: ItemId,
        mut resource: Resource,
    ) -> Result<Change> {
        let item = self.get_mut(id)?;
        if item.state.is_terminal() || !item.resource.is_placeholder {
            return Ok(Change::unchanged(id, item.state));
        }

        resource.id = Some(id);
        resource.is_placeholder = false;
        resource.is_transcoding = item.resource.is_transcoding;

        let superseded = superseded_handles(&item.resource, &resource);
        item.resource = resource;

        Ok(Change {
            id,
            from: item.state,
            to: item.state,
            superseded,
            resource_changed: true,
        })
    }

    /// Removes the item whatever its state.
    pub fn remove_item(&mut self, id: ItemId) -> Option<QueueItem> {
        let index = self.items.iter().position(|item| item.id == id)?;
        Some(self.items.remove(index))
    }

    pub fn apply(&mut self, id: ItemId, op: QueueOp) -> Result<Change> {
        match op {
            QueueOp::StartTranscoding => self.start_transcoding(id),
            QueueOp::FinishTranscoding { file, additional_data } => {
                let change = self.finish_transcoding(id, file)?;
                self.merge_additional_data(id, additional_data)?;
                Ok(change)
            }
            QueueOp::StartUploading => self.start_uploading(id),
            QueueOp::CompleteUpload { attachment } => {
                let current = self.get(id).ok_or(MediaQueueError::ItemNotFound(id))?;
                let resource = resource_from_attachment(&attachment, &current.resource);
                self.finish_uploading(id, resource)
            }
            QueueOp::CancelUploading { error, .. } => self.cancel_uploading(id, error),
            QueueOp::ReplacePlaceholderResource { resource } => {
                self.replace_placeholder_resource(id, resource)
            }
        }
    }

    /// Whether any item's resource still uses `handle` as its `src` or poster.
    pub fn references(&self, handle: &str) -> bool {
        self.items.iter().any(|item| {
            item.resource.src == handle || item.resource.poster.as_deref() == Some(handle)
        })
    }

    pub fn get(&self, id: ItemId) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn get_mut(&mut self, id: ItemId) -> Result<&mut QueueItem> {
        self.items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(MediaQueueError::ItemNotFound(id))
    }

    fn transition(
        &mut self,
        id: ItemId,
        op: &'static str,
        to: ItemState,
    ) -> Result<(&mut QueueItem, ItemState)> {
        let item = self.get_mut(id)?;
        let from = item.state;

        if !ItemState::is_valid_transition(from, to) {
            return Err(MediaQueueError::InvalidTransition { id, from, op });
        }

        let now = Utc::now();
        item.state = to;
        if from == ItemState::Pending {
            item.started_at = Some(now);
        }
        if to.is_terminal() {
            item.completed_at = Some(now);
        }

        Ok((item, from))
    }
}

/// Blob handles of `old` that `new` no longer carries in the same field.
fn superseded_handles(old: &Resource, new: &Resource) -> Vec<String> {
    let mut superseded = Vec::new();

    if old.src != new.src && is_blob_handle(&old.src) {
        superseded.push(old.src.clone());
    }

    if let Some(poster) = &old.poster {
        if new.poster.as_ref() != Some(poster) && is_blob_handle(poster) {
            superseded.push(poster.clone());
        }
    }

    superseded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::MediaDetails;

    fn add_png(store: &mut QueueStore) -> ItemId {
        let file = MediaFile::new("photo.png", "image/png", vec![0u8; 16]);
        let resource = Resource::placeholder(&file, "blob:photo");
        store.add_item(file, resource, AdditionalData::new())
    }

    fn server_resource(src: &str, poster: Option<&str>) -> Resource {
        let file = MediaFile::new("photo.png", "image/png", Vec::new());
        let mut resource = Resource::placeholder(&file, src);
        resource.poster = poster.map(String::from);
        resource.is_placeholder = false;
        resource
    }

    #[test]
    fn test_add_item_is_pending() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);

        let item = store.get(id).unwrap();
        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.resource.id, Some(id));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_direct_upload_path() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);

        let change = store.start_uploading(id).unwrap();
        assert_eq!((change.from, change.to), (ItemState::Pending, ItemState::Uploading));
        assert!(store.get(id).unwrap().started_at.is_some());

        let change = store
            .finish_uploading(id, server_resource("https://cdn/photo.png", None))
            .unwrap();
        assert_eq!(change.to, ItemState::Uploaded);
        assert_eq!(change.superseded, vec!["blob:photo".to_string()]);

        let item = store.get(id).unwrap();
        assert_eq!(item.resource.src, "https://cdn/photo.png");
        assert_eq!(item.resource.id, Some(id));
        assert!(item.completed_at.is_some());
    }

    #[test]
    fn test_transcode_path_replaces_file() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);

        store.start_transcoding(id).unwrap();
        assert!(store.get(id).unwrap().resource.is_transcoding);

        let output = MediaFile::new("photo.mp4", "video/mp4", vec![1u8; 4]);
        store.finish_transcoding(id, output.clone()).unwrap();

        let item = store.get(id).unwrap();
        assert_eq!(item.state, ItemState::Transcoded);
        assert_eq!(item.file, output);
        assert!(!item.resource.is_transcoding);

        assert!(store.start_uploading(id).is_ok());
    }

    #[test]
    fn test_cannot_skip_uploading() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);

        let err = store.finish_uploading(id, server_resource("https://cdn/x", None)).unwrap_err();
        assert!(matches!(err, MediaQueueError::InvalidTransition { from: ItemState::Pending, .. }));
        assert_eq!(store.get(id).unwrap().state, ItemState::Pending);
        assert!(store.get(id).unwrap().resource.is_placeholder);
    }

    #[test]
    fn test_cancel_only_from_active_states() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);

        assert!(store.cancel_uploading(id, "boom").is_err());

        store.start_transcoding(id).unwrap();
        let change = store.cancel_uploading(id, "engine crashed").unwrap();
        assert_eq!(change.to, ItemState::Cancelled);

        let item = store.get(id).unwrap();
        assert_eq!(item.error.as_deref(), Some("engine crashed"));
        assert!(!item.resource.is_transcoding);
    }

    #[test]
    fn test_terminal_states_are_inert() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);
        store.start_uploading(id).unwrap();
        store.cancel_uploading(id, "offline").unwrap();

        assert!(store.start_uploading(id).is_err());
        assert!(store.start_transcoding(id).is_err());
        assert!(store.finish_uploading(id, server_resource("https://cdn/x", None)).is_err());
        assert!(store.merge_additional_data(id, AdditionalData::new()).is_err());

        let before = store.get(id).unwrap().resource.clone();
        let change = store
            .replace_placeholder_resource(id, server_resource("blob:new", None))
            .unwrap();
        assert!(change.is_noop());
        assert_eq!(store.get(id).unwrap().resource, before);
    }

    #[test]
    fn test_replace_placeholder_once() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);

        let mut richer = server_resource("blob:photo", Some("blob:poster"));
        richer.width = 640;
        richer.height = 480;

        let change = store.replace_placeholder_resource(id, richer).unwrap();
        assert!(change.resource_changed);
        assert!(change.superseded.is_empty());

        let item = store.get(id).unwrap();
        assert!(!item.resource.is_placeholder);
        assert_eq!(item.resource.id, Some(id));
        assert_eq!(item.resource.width, 640);

        // Already non-placeholder
        let change = store
            .replace_placeholder_resource(id, server_resource("blob:other", None))
            .unwrap();
        assert!(change.is_noop());
        assert_eq!(store.get(id).unwrap().resource.src, "blob:photo");
    }

    #[test]
    fn test_revocation_follows_field_changes() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);
        store
            .replace_placeholder_resource(id, server_resource("blob:photo", Some("blob:poster")))
            .unwrap();
        store.start_uploading(id).unwrap();

        // Same poster carried over, only src superseded
        let change = store
            .finish_uploading(id, server_resource("https://cdn/photo.png", Some("blob:poster")))
            .unwrap();
        assert_eq!(change.superseded, vec!["blob:photo".to_string()]);
    }

    #[test]
    fn test_unchanged_src_is_not_revoked() {
        let mut store = QueueStore::new();
        let file = MediaFile::new("a.png", "image/png", Vec::new());
        let resource = Resource::placeholder(&file, "https://cdn/a.png");
        let id = store.add_item(file, resource, AdditionalData::new());
        store.start_uploading(id).unwrap();

        let change = store
            .finish_uploading(id, server_resource("https://cdn/a.png", None))
            .unwrap();
        assert!(change.superseded.is_empty());
    }

    #[test]
    fn test_complete_upload_carries_local_poster() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);
        store
            .replace_placeholder_resource(id, server_resource("blob:photo", Some("blob:poster")))
            .unwrap();
        store.apply(id, QueueOp::StartUploading).unwrap();

        let attachment = Attachment {
            id: 7,
            source_url: "https://cdn/photo.png".to_string(),
            mime_type: "image/png".to_string(),
            media_details: MediaDetails { width: 10, height: 20 },
            poster: None,
            alt_text: None,
        };
        let change = store.apply(id, QueueOp::CompleteUpload { attachment }).unwrap();
        assert_eq!(change.superseded, vec!["blob:photo".to_string()]);

        let item = store.get(id).unwrap();
        assert_eq!(item.resource.poster.as_deref(), Some("blob:poster"));
        assert_eq!(item.resource.server_id, Some(7));
    }

    #[test]
    fn test_finish_transcoding_op_merges_tag() {
        let mut store = QueueStore::new();
        let id = add_png(&mut store);
        store.apply(id, QueueOp::StartTranscoding).unwrap();

        let mut tag = AdditionalData::new();
        tag.insert("media_source".to_string(), "video-optimization".to_string());
        let file = MediaFile::new("photo.mp4", "video/mp4", Vec::new());
        store
            .apply(id, QueueOp::FinishTranscoding { file, additional_data: tag })
            .unwrap();

        let item = store.get(id).unwrap();
        assert_eq!(
            item.additional_data.get("media_source").map(String::as_str),
            Some("video-optimization")
        );
    }

    #[test]
    fn test_remove_item_any_state() {
        let mut store = QueueStore::new();
        let a = add_png(&mut store);
        let b = add_png(&mut store);
        store.start_uploading(b).unwrap();

        assert_eq!(store.remove_item(b).map(|item| item.id), Some(b));
        assert!(store.remove_item(b).is_none());
        assert!(matches!(store.start_uploading(b), Err(MediaQueueError::ItemNotFound(_))));
        assert_eq!(store.items().iter().map(|item| item.id).collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn test_references_shared_handles() {
        let mut store = QueueStore::new();
        let first = add_png(&mut store);
        let retry = add_png(&mut store);

        store.remove_item(first);
        assert!(store.references("blob:photo"));

        store.remove_item(retry);
        assert!(!store.references("blob:photo"));
        assert!(!store.references("blob:other"));
    }
}
