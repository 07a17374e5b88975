pub mod blob;
pub mod config;
pub mod errors;
pub mod ffmpeg;
pub mod probe;
pub mod queue;
pub mod scheduler;
pub mod transcode;
pub mod types;
pub mod upload;
pub mod uploaders;

// 重新导出核心类型
pub use blob::BlobCache;
pub use errors::{MediaQueueError, Result};
pub use queue::{QueueView, UploadCallback};
pub use scheduler::{
    FilteredEventReceiver, MediaQueue, MediaQueueBuilder, MediaQueueHandle, QueueEvent,
};
pub use transcode::{TranscodePolicy, Transcoder};
pub use types::{
    AdditionalData, ItemId, ItemState, MediaFile, QueueItem, Resource, ResourceKind, Stage,
};
pub use upload::{Attachment, Uploader};

pub use ffmpeg::{FfmpegProbe, FfmpegTranscoder};
pub use uploaders::HttpUploader;
