pub mod channel;
pub mod config;
pub mod error;
pub mod family;
pub mod hub_api;
pub mod machine;
pub mod relay;
pub mod router;
pub mod runtime;
pub mod sync;
pub mod task;

pub use error::{SyncError, SyncResult};
