pub mod client;
pub mod config;
pub mod mask;
pub mod rpc;
pub mod service;
pub mod store;

// Re-export auth so main.rs can use taskd::auth directly.
pub use rpc::auth;

use std::sync::Arc;

use config::TaskdConfig;
use store::MemStore;

/// Shared application state cloned into every connection task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<TaskdConfig>,
    pub store: Arc<MemStore>,
    pub started_at: std::time::Instant,
    /// Bearer token every call must carry in its `meta.authorization` header.
    /// Empty string means auth is disabled (not recommended).
    pub auth_token: String,
}
