pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod queue;
pub mod store;

pub use config::RelayConfig;
pub use context::RequestContext;
pub use error::{ErrorBody, QueueError, RelayError, StoreError};
pub use queue::{create_queue, QueueBackend};
pub use store::{create_backend, StateBackend};
