mod manager;
mod manager_worker;
mod pipeline;

pub use manager::{
    FilteredEventReceiver, MediaQueue, MediaQueueBuilder, MediaQueueHandle, QueueEvent,
};
pub(crate) use pipeline::{report_failure, Committer};
