use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use crate::blob::BlobCache;
use crate::config::QueueConfig;
use crate::errors::{MediaQueueError, Result};
use crate::probe::{ImageProbe, LocalProbe};
use crate::queue::{QueueView, UploadCallback};
use crate::transcode::{TranscodePolicy, TranscodeWorker, Transcoder};
use crate::types::{AdditionalData, ItemId, ItemState, MediaFile, QueueItem, Resource, Stage};
use crate::upload::{UploadWorker, Uploader};
use super::manager_worker::{QueueCommand, QueueWorker};
use super::pipeline::{Committer, PipelineContext};

/// Queue notifications, broadcast to every subscriber.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    ItemAdded {
        id: ItemId,
    },
    StateChanged {
        id: ItemId,
        from: ItemState,
        to: ItemState,
    },
    /// The item's preview resource was replaced
    ResourceUpdated {
        id: ItemId,
    },
    Failed {
        id: ItemId,
        stage: Stage,
        error: String,
    },
    ItemRemoved {
        id: ItemId,
    },
}

impl QueueEvent {
    pub fn id(&self) -> ItemId {
        match self {
            QueueEvent::ItemAdded { id }
            | QueueEvent::StateChanged { id, .. }
            | QueueEvent::ResourceUpdated { id }
            | QueueEvent::Failed { id, .. }
            | QueueEvent::ItemRemoved { id } => *id,
        }
    }
}

#[derive(Clone)]
pub struct MediaQueue {
    command_tx: mpsc::Sender<QueueCommand>,
    event_tx: broadcast::Sender<QueueEvent>,
    blobs: BlobCache,
}

/// 队列句柄 - 包含队列和工作线程
pub struct MediaQueueHandle {
    pub queue: MediaQueue,
    pub worker_handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl MediaQueueHandle {
    /// Stops the worker without waiting for in-flight items.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        drop(self.queue);
        self.worker_handle
            .await
            .map_err(|err| MediaQueueError::InternalError(format!("Worker panic: {}", err)))
    }
}

impl MediaQueue {
    pub fn builder() -> MediaQueueBuilder {
        MediaQueueBuilder::new()
    }

    /// Adds a file. `resource` is the placeholder shown until a local preview
    /// or the server's attachment replaces it.
    pub async fn add_item(
        &self,
        file: MediaFile,
        resource: Resource,
        handlers: Option<Arc<dyn UploadCallback>>,
        additional_data: Option<AdditionalData>,
    ) -> Result<ItemId> {
        self.request(|reply| QueueCommand::AddItem {
            file,
            resource,
            handlers,
            additional_data: additional_data.unwrap_or_default(),
            reply,
        })
        .await
    }

    /// Removes the item whatever its state. A running pipeline for it stops at
    /// its next commit.
    pub async fn remove_item(&self, id: ItemId) -> Result<Option<QueueItem>> {
        self.request(|reply| QueueCommand::RemoveItem { id, reply }).await
    }

    pub async fn get_item(&self, id: ItemId) -> Result<Option<QueueItem>> {
        self.request(|reply| QueueCommand::GetItem { id, reply }).await
    }

    pub async fn get_all_items(&self) -> Result<Vec<QueueItem>> {
        self.request(|reply| QueueCommand::GetAllItems { reply }).await
    }

    pub async fn view(&self) -> Result<QueueView> {
        self.request(|reply| QueueCommand::View { reply }).await
    }

    /// Resolves once no preview, backfill or pipeline task is running.
    pub async fn wait_until_settled(&self) -> Result<()> {
        self.request(|reply| QueueCommand::WaitSettled { reply }).await
    }

    /// 订阅事件
    ///
    /// 接收速度跟不上时会丢失事件（lagged error）
    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    /// Subscribes to the events `filter` accepts, e.g. one item's state changes.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredEventReceiver<F>
    where
        F: Fn(&QueueEvent) -> bool,
    {
        FilteredEventReceiver {
            receiver: self.event_tx.subscribe(),
            filter,
        }
    }

    /// Local object handles used by item resources
    pub fn blob_cache(&self) -> &BlobCache {
        &self.blobs
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> QueueCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| MediaQueueError::ManagerShutdown)?;

        reply_rx.await.map_err(|_| MediaQueueError::ManagerShutdown)
    }
}

/// Event subscription that only yields matching events.
pub struct FilteredEventReceiver<F> {
    receiver: broadcast::Receiver<QueueEvent>,
    filter: F,
}

impl<F> FilteredEventReceiver<F>
where
    F: Fn(&QueueEvent) -> bool,
{
    /// Next matching event, or `None` once the queue worker is gone. Events
    /// lost to lag are skipped.
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if (self.filter)(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "filtered event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct MediaQueueBuilder {
    config: QueueConfig,
    policy: TranscodePolicy,
    uploader: Option<Arc<dyn Uploader>>,
    transcoder: Option<Arc<dyn Transcoder>>,
    probe: Arc<dyn LocalProbe>,
    blobs: BlobCache,
}

impl Default for MediaQueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaQueueBuilder {
    pub fn new() -> Self {
        Self {
            config: QueueConfig::default(),
            policy: TranscodePolicy::default(),
            uploader: None,
            transcoder: None,
            probe: Arc::new(ImageProbe),
            blobs: BlobCache::new(),
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn policy(mut self, policy: TranscodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Without a transcoder every file is uploaded as added.
    pub fn transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn LocalProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Shares a cache the caller already registered placeholder handles in.
    pub fn blob_cache(mut self, blobs: BlobCache) -> Self {
        self.blobs = blobs;
        self
    }

    /// Spawns the queue worker. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<MediaQueueHandle> {
        let uploader = self
            .uploader
            .ok_or_else(|| MediaQueueError::ConfigError("an uploader is required".to_string()))?;

        let policy = match self.transcoder {
            Some(_) => self.policy,
            None => TranscodePolicy::disabled(),
        };

        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity.max(1));
        let (event_tx, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let transcode_limit = self.config.max_concurrent_transcodes.max(1);
        let upload_limit = self.config.max_concurrent_uploads.max(1);
        let ctx = Arc::new(PipelineContext {
            committer: Committer::new(internal_tx.clone()),
            blobs: self.blobs.clone(),
            policy,
            probe: self.probe,
            transcode_worker: self.transcoder.map(TranscodeWorker::new),
            upload_worker: UploadWorker::new(uploader),
            transcode_permits: Arc::new(Semaphore::new(transcode_limit)),
            upload_permits: Arc::new(Semaphore::new(upload_limit)),
        });

        let worker = QueueWorker::new(self.blobs.clone(), ctx, event_tx.clone(), internal_tx);
        let worker_handle = tokio::spawn(worker.run(command_rx, internal_rx, shutdown.clone()));

        let queue = MediaQueue {
            command_tx,
            event_tx,
            blobs: self.blobs,
        };

        Ok(MediaQueueHandle {
            queue,
            worker_handle,
            shutdown,
        })
    }
}
