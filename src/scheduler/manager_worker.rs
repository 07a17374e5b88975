use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use crate::blob::BlobCache;
use crate::errors::MediaQueueError;
use crate::queue::{
    Change, HandlerRegistry, QueueOp, QueueStore, QueueView, UploadCallback, UploadHook,
};
use crate::types::{AdditionalData, ItemId, ItemState, MediaFile, QueueItem, Resource, Stage};
use super::manager::QueueEvent;
use super::pipeline::{run_backfill, run_pipeline, CommitOutcome, PipelineContext, WorkerMessage};

/// 队列命令
pub(crate) enum QueueCommand {
    AddItem {
        file: MediaFile,
        resource: Resource,
        handlers: Option<Arc<dyn UploadCallback>>,
        additional_data: AdditionalData,
        reply: oneshot::Sender<ItemId>,
    },
    RemoveItem {
        id: ItemId,
        reply: oneshot::Sender<Option<QueueItem>>,
    },
    GetItem {
        id: ItemId,
        reply: oneshot::Sender<Option<QueueItem>>,
    },
    GetAllItems {
        reply: oneshot::Sender<Vec<QueueItem>>,
    },
    View {
        reply: oneshot::Sender<QueueView>,
    },
    /// Replies once nothing is in flight
    WaitSettled {
        reply: oneshot::Sender<()>,
    },
}

/// Owns the store. Every mutation, from callers or from running pipelines,
/// is applied here one at a time, and after each one the scheduling passes
/// run again.
pub(crate) struct QueueWorker {
    store: QueueStore,
    handlers: HandlerRegistry,
    blobs: BlobCache,
    ctx: Arc<PipelineContext>,
    event_tx: broadcast::Sender<QueueEvent>,
    internal_tx: mpsc::UnboundedSender<WorkerMessage>,

    /// Items whose pipeline was started; never started twice
    dispatched: HashSet<ItemId>,
    backfilled: HashSet<ItemId>,
    active_tasks: usize,
    settle_waiters: Vec<oneshot::Sender<()>>,
}

impl QueueWorker {
    pub(crate) fn new(
        blobs: BlobCache,
        ctx: Arc<PipelineContext>,
        event_tx: broadcast::Sender<QueueEvent>,
        internal_tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        Self {
            store: QueueStore::new(),
            handlers: HandlerRegistry::new(),
            blobs,
            ctx,
            event_tx,
            internal_tx,
            dispatched: HashSet::new(),
            backfilled: HashSet::new(),
            active_tasks: 0,
            settle_waiters: Vec::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<QueueCommand>,
        mut internal_rx: mpsc::UnboundedReceiver<WorkerMessage>,
        shutdown: CancellationToken,
    ) {
        info!("media queue started");
        let mut commands_closed = false;

        // 主事件循环
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = command_rx.recv(), if !commands_closed => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_closed = true,
                },
                Some(message) = internal_rx.recv() => {
                    self.handle_message(message);
                }
            }

            self.schedule();
            self.notify_settled();

            if commands_closed && self.active_tasks == 0 {
                break;
            }
        }

        info!(items = self.store.len(), active_tasks = self.active_tasks, "media queue stopped");
    }

    fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::AddItem { file, resource, handlers, additional_data, reply } => {
                let name = file.name.clone();
                let size = file.size;
                let id = self.store.add_item(file, resource, additional_data);

                if let Some(handlers) = handlers {
                    self.handlers.register(id, handlers);
                }

                info!(item_id = %id, file = %name, size, "item added");
                let _ = self.event_tx.send(QueueEvent::ItemAdded { id });
                let _ = reply.send(id);
            }
            QueueCommand::RemoveItem { id, reply } => {
                let removed = self.remove_item(id);
                let _ = reply.send(removed);
            }
            QueueCommand::GetItem { id, reply } => {
                let _ = reply.send(self.store.get(id).cloned());
            }
            QueueCommand::GetAllItems { reply } => {
                let _ = reply.send(self.store.items().to_vec());
            }
            QueueCommand::View { reply } => {
                let _ = reply.send(QueueView::from_items(self.store.iter()));
            }
            QueueCommand::WaitSettled { reply } => {
                self.settle_waiters.push(reply);
            }
        }
    }

    fn remove_item(&mut self, id: ItemId) -> Option<QueueItem> {
        let item = self.store.remove_item(id)?;

        self.handlers.remove(id);
        self.dispatched.remove(&id);
        self.backfilled.remove(&id);

        // A retry item may share the removed item's handles
        let handles = std::iter::once(&item.resource.src).chain(item.resource.poster.as_ref());
        for handle in handles {
            if !self.store.references(handle) && self.blobs.revoke(handle) {
                debug!(item_id = %id, handle = %handle, "blob handle revoked");
            }
        }

        info!(item_id = %id, state = %item.state, "item removed");
        let _ = self.event_tx.send(QueueEvent::ItemRemoved { id });
        Some(item)
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Commit { id, op, reply } => {
                let stage = match &op {
                    QueueOp::CancelUploading { stage, .. } => Some(*stage),
                    _ => None,
                };

                let result = self.store.apply(id, op).and_then(|change| {
                    let applied = !change.is_noop();
                    self.after_change(&change, stage);
                    self.store
                        .get(id)
                        .cloned()
                        .map(|item| CommitOutcome { item, applied })
                        .ok_or(MediaQueueError::ItemNotFound(id))
                });

                if let Err(err) = &result {
                    debug!(item_id = %id, error = %err, "commit rejected");
                }

                let _ = reply.send(result);
            }
            WorkerMessage::TaskFinished => {
                self.active_tasks = self.active_tasks.saturating_sub(1);
            }
        }
    }

    fn after_change(&mut self, change: &Change, stage: Option<Stage>) {
        let id = change.id;

        for handle in &change.superseded {
            if self.blobs.revoke(handle) {
                debug!(item_id = %id, handle = %handle, "blob handle revoked");
            }
        }

        if change.resource_changed {
            let _ = self.event_tx.send(QueueEvent::ResourceUpdated { id });
        }

        if !change.state_changed() {
            return;
        }

        debug!(item_id = %id, from = %change.from, to = %change.to, "state changed");
        let _ = self.event_tx.send(QueueEvent::StateChanged {
            id,
            from: change.from,
            to: change.to,
        });

        let Some(item) = self.store.get(id) else {
            return;
        };

        if change.to == ItemState::Cancelled {
            let _ = self.event_tx.send(QueueEvent::Failed {
                id,
                stage: stage.unwrap_or(Stage::Upload),
                error: item.error.clone().unwrap_or_default(),
            });
        }

        if let Some(hook) = UploadHook::for_state(change.to) {
            self.handlers.fire(hook, item);
        }
    }

    /// Picks up newly pending items for dispatch and transcoded placeholders
    /// for backfill. Each item is picked up at most once per pass; the
    /// dispatched pipeline runs the early preview itself, before transcoding.
    fn schedule(&mut self) {
        let mut backfills = Vec::new();
        let mut dispatches = Vec::new();

        for item in self.store.iter() {
            match item.state {
                ItemState::Pending if !self.dispatched.contains(&item.id) => {
                    self.dispatched.insert(item.id);
                    dispatches.push(item.clone());
                }
                ItemState::Transcoded
                    if item.resource.is_placeholder
                        && item.resource.poster.is_none()
                        && !self.backfilled.contains(&item.id) =>
                {
                    self.backfilled.insert(item.id);
                    backfills.push(item.clone());
                }
                _ => {}
            }
        }

        for item in backfills {
            debug!(item_id = %item.id, "backfilling placeholder");
            self.spawn_tracked(run_backfill(self.ctx.clone(), item));
        }

        for item in dispatches {
            debug!(item_id = %item.id, file = %item.file.name, "dispatching pipeline");
            self.spawn_tracked(run_pipeline(self.ctx.clone(), item));
        }
    }

    fn spawn_tracked<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.active_tasks += 1;
        let internal_tx = self.internal_tx.clone();
        let task = tokio::spawn(future);

        tokio::spawn(async move {
            if let Err(err) = task.await {
                error!(error = %err, "queue task panicked");
            }
            let _ = internal_tx.send(WorkerMessage::TaskFinished);
        });
    }

    fn notify_settled(&mut self) {
        if self.active_tasks > 0 || self.settle_waiters.is_empty() {
            return;
        }

        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}
