mod handlers;
mod store;
mod view;

pub use handlers::{HandlerRegistry, UploadCallback, UploadHook};
pub use store::{Change, QueueOp, QueueStore};
pub use view::QueueView;
