pub mod api;
pub mod config;
pub mod content;
pub mod error;
pub mod models;
pub mod net;
pub mod repo;
pub mod revision;
pub mod sync;

// Re-export commonly used items for tests / external users
pub use api::{BooruApi, DanbooruApi};
pub use config::MirrorConfig;
pub use error::{SyncError, SyncResult};
pub use net::{BackoffPolicy, FetchClient};
pub use sync::{PostSync, SyncEngine};
