use thiserror::Error;
use crate::types::{ItemId, ItemState, Stage};

#[derive(Error, Debug)]
pub enum MediaQueueError {
    /// The file is not a transcoding candidate. Used to skip the transcode stage, never to abort.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transcoding error: {0}")]
    Transcoding(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Server error: status code {status_code}, message: {message}")]
    ServerError {
        status_code: u16,
        message: String,
    },

    #[error("Item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Cannot {op} item {id} in state {from:?}")]
    InvalidTransition {
        id: ItemId,
        from: ItemState,
        op: &'static str,
    },

    #[error("HTTP Request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Queue shut down")]
    ManagerShutdown,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl MediaQueueError {
    pub fn transcoding(message: impl Into<String>) -> Self {
        Self::Transcoding(message.into())
    }

    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload(message.into())
    }

    pub fn probe(message: impl Into<String>) -> Self {
        Self::Probe(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError(message.into())
    }

    /// Folds a failure into the category of the stage it happened in, keeping
    /// the underlying message.
    pub fn for_stage(self, stage: Stage) -> Self {
        match (stage, self) {
            (_, err) if err.is_detached() => err,
            (Stage::Probe, err @ Self::Probe(_)) => err,
            (Stage::Transcode, err @ Self::Transcoding(_)) => err,
            (Stage::Upload, err @ Self::Upload(_)) => err,
            (Stage::Probe, err) => Self::probe(err.to_string()),
            (Stage::Transcode, err) => Self::transcoding(err.to_string()),
            (Stage::Upload, err) => Self::upload(err.to_string()),
        }
    }

    /// Errors that mean the item or the queue is gone, as opposed to a stage failing.
    pub fn is_detached(&self) -> bool {
        matches!(self, Self::ItemNotFound(_) | Self::ManagerShutdown)
    }
}

/// Error alias
pub type Result<T, E = MediaQueueError> = std::result::Result<T, E>;
