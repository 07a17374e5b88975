use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error};
use crate::blob::BlobCache;
use crate::errors::{MediaQueueError, Result};
use crate::probe::{local_resource, LocalProbe};
use crate::queue::QueueOp;
use crate::transcode::{TranscodePolicy, TranscodeWorker};
use crate::types::{ItemId, QueueItem, Resource, Stage};
use crate::upload::UploadWorker;

pub(crate) struct CommitOutcome {
    /// Item as committed
    pub item: QueueItem,
    /// False when the store treated the operation as a no-op
    pub applied: bool,
}

/// Messages from spawned tasks back to the queue worker.
pub(crate) enum WorkerMessage {
    Commit {
        id: ItemId,
        op: QueueOp,
        reply: oneshot::Sender<Result<CommitOutcome>>,
    },
    TaskFinished,
}

/// A task's way to mutate its item. Each commit waits until the queue worker
/// has applied it, so a later stage never starts before the prior effect is in
/// the store.
#[derive(Clone)]
pub(crate) struct Committer {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl Committer {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { tx }
    }

    pub(crate) async fn commit(&self, id: ItemId, op: QueueOp) -> Result<CommitOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(WorkerMessage::Commit { id, op, reply: reply_tx })
            .map_err(|_| MediaQueueError::ManagerShutdown)?;

        reply_rx
            .await
            .map_err(|_| MediaQueueError::ManagerShutdown)?
    }
}

/// Telemetry for a stage failure that cancelled an item.
pub(crate) fn report_failure(stage: Stage, item: &QueueItem, err: &MediaQueueError) {
    error!(
        target: "mediaqueue::telemetry",
        item_id = %item.id,
        stage = %stage,
        file = %item.file.name,
        mime_type = %item.file.mime_type,
        file_size = item.file.size,
        error = %err,
        "media item cancelled"
    );
}

pub(crate) struct PipelineContext {
    pub committer: Committer,
    pub blobs: BlobCache,
    pub policy: TranscodePolicy,
    pub probe: Arc<dyn LocalProbe>,
    pub transcode_worker: Option<TranscodeWorker>,
    pub upload_worker: UploadWorker,
    pub transcode_permits: Arc<Semaphore>,
    pub upload_permits: Arc<Semaphore>,
}

/// Drives one pending item through early preview, transcoding and upload, in
/// that order. Preview and transcoding only run for eligible files.
pub(crate) async fn run_pipeline(ctx: Arc<PipelineContext>, item: QueueItem) {
    let id = item.id;
    let kind = match ctx.policy.check_async(&item.file).await {
        Ok(kind) => Some(kind),
        Err(reason) => {
            debug!(item_id = %id, reason = %reason, "transcoding skipped");
            None
        }
    };

    if kind.is_some() && item.resource.is_placeholder {
        run_preview(&ctx, &item).await;
    }

    if let (Some(kind), Some(worker)) = (kind, ctx.transcode_worker.as_ref()) {
        let Ok(_permit) = ctx.transcode_permits.acquire().await else {
            return;
        };

        if let Err(err) = worker.run(id, kind, &ctx.committer).await {
            log_stopped(id, Stage::Transcode, &err);
            return;
        }
    }

    let Ok(_permit) = ctx.upload_permits.acquire().await else {
        return;
    };

    if let Err(err) = ctx.upload_worker.run(id, &ctx.committer).await {
        log_stopped(id, Stage::Upload, &err);
    }
}

fn log_stopped(id: ItemId, stage: Stage, err: &MediaQueueError) {
    if err.is_detached() {
        debug!(
            item_id = %id,
            stage = %stage,
            error = %err,
            "pipeline stopped, item no longer queued"
        );
    } else {
        debug!(item_id = %id, stage = %stage, "pipeline ended after failure");
    }
}

/// Early preview: probes the original file so the placeholder gets real
/// dimensions and a poster. Failures leave the item untouched.
async fn run_preview(ctx: &PipelineContext, item: &QueueItem) {
    let info = match ctx.probe.probe(&item.file).await {
        Ok(info) => info,
        Err(err) => {
            debug!(item_id = %item.id, error = %err, "early preview unavailable");
            return;
        }
    };

    let poster = info.poster.clone().map(|data| ctx.blobs.register(data));
    let src = item.resource.src.clone();
    let resource = local_resource(&item.resource, &item.file, &info, src, poster.clone());

    commit_local_resource(ctx, item.id, resource, poster.into_iter().collect()).await;
}

/// Placeholder backfill: rebuilds the local resource from the transcoded file.
pub(crate) async fn run_backfill(ctx: Arc<PipelineContext>, item: QueueItem) {
    let src = ctx.blobs.register(item.file.data.clone());

    let info = match ctx.probe.probe(&item.file).await {
        Ok(info) => info,
        Err(err) => {
            debug!(item_id = %item.id, error = %err, "placeholder backfill unavailable");
            ctx.blobs.revoke(&src);
            return;
        }
    };

    let poster = info.poster.clone().map(|data| ctx.blobs.register(data));
    let resource = local_resource(&item.resource, &item.file, &info, src.clone(), poster.clone());

    let mut fresh = vec![src];
    fresh.extend(poster);
    commit_local_resource(&ctx, item.id, resource, fresh).await;
}

/// Commits a locally built resource, revoking its new handles if the store
/// kept the old one.
async fn commit_local_resource(
    ctx: &PipelineContext,
    id: ItemId,
    resource: Resource,
    fresh: Vec<String>,
) {
    let op = QueueOp::ReplacePlaceholderResource { resource };
    let applied = match ctx.committer.commit(id, op).await {
        Ok(outcome) => outcome.applied,
        Err(err) => {
            debug!(item_id = %id, error = %err, "local resource dropped");
            false
        }
    };

    if applied {
        debug!(item_id = %id, "placeholder replaced with local resource");
        return;
    }

    for handle in fresh {
        ctx.blobs.revoke(&handle);
    }
}
