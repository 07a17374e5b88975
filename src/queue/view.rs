use serde::Serialize;
use crate::types::{ItemState, QueueItem};

/// Snapshot of the queue partitioned by state, for rendering progress.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueView {
    /// Waiting for work to start
    pub pending: Vec<QueueItem>,
    /// Transcoding, transcoded or uploading
    pub progress: Vec<QueueItem>,
    /// Uploaded
    pub processed: Vec<QueueItem>,
    /// Cancelled, kept until the caller removes them
    pub failures: Vec<QueueItem>,
    pub is_uploading: bool,
    pub is_transcoding: bool,
}

impl QueueView {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a QueueItem>) -> Self {
        let mut view = Self::default();

        for item in items {
            match item.state {
                ItemState::Pending => view.pending.push(item.clone()),
                ItemState::Transcoding | ItemState::Transcoded | ItemState::Uploading => {
                    view.progress.push(item.clone())
                }
                ItemState::Uploaded => view.processed.push(item.clone()),
                ItemState::Cancelled => view.failures.push(item.clone()),
            }
        }

        view.is_uploading = !view.pending.is_empty() || !view.progress.is_empty();
        view.is_transcoding = view.progress.iter().any(|item| item.state == ItemState::Transcoding);
        view
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
            && self.progress.is_empty()
            && self.processed.is_empty()
            && self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStore;
    use crate::types::{AdditionalData, MediaFile, Resource};

    fn add(store: &mut QueueStore, name: &str) -> crate::types::ItemId {
        let file = MediaFile::new(name, "", vec![0u8; 2]);
        let resource = Resource::placeholder(&file, format!("blob:{}", name));
        store.add_item(file, resource, AdditionalData::new())
    }

    #[test]
    fn test_view_partitions_by_state() {
        let mut store = QueueStore::new();
        let pending = add(&mut store, "a.png");
        let transcoding = add(&mut store, "b.mov");
        let uploaded = add(&mut store, "c.png");
        let failed = add(&mut store, "d.png");

        store.start_transcoding(transcoding).unwrap();
        store.start_uploading(uploaded).unwrap();
        let file = MediaFile::new("c.png", "", Vec::new());
        let served = Resource::placeholder(&file, "https://cdn/c.png");
        store.finish_uploading(uploaded, served).unwrap();
        store.start_uploading(failed).unwrap();
        store.cancel_uploading(failed, "offline").unwrap();

        let view = QueueView::from_items(store.iter());
        assert_eq!(view.pending.iter().map(|item| item.id).collect::<Vec<_>>(), vec![pending]);
        assert_eq!(view.progress.iter().map(|item| item.id).collect::<Vec<_>>(), vec![transcoding]);
        assert_eq!(view.processed.iter().map(|item| item.id).collect::<Vec<_>>(), vec![uploaded]);
        assert_eq!(view.failures.iter().map(|item| item.id).collect::<Vec<_>>(), vec![failed]);
        assert!(view.is_uploading);
        assert!(view.is_transcoding);
    }

    #[test]
    fn test_settled_queue_is_not_uploading() {
        let mut store = QueueStore::new();
        let id = add(&mut store, "a.png");
        store.start_uploading(id).unwrap();
        store.cancel_uploading(id, "offline").unwrap();

        let view = QueueView::from_items(store.iter());
        assert!(!view.is_uploading);
        assert!(!view.is_transcoding);
        assert_eq!(view.failures.len(), 1);

        assert!(QueueView::from_items(QueueStore::new().iter()).is_empty());
    }
}
