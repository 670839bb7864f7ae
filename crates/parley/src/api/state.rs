//! Application state shared across handlers.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthState;
use crate::coordinator::Coordinator;
use crate::metadata::SessionMetadataStore;
use crate::producer::ProducerClient;
use crate::proxy::ConsumerProxy;

#[derive(Clone)]
pub struct AppState {
    /// Writes user-originated entries and relays raw producer appends.
    pub producer: ProducerClient,
    /// Serves catch-up and live reads.
    pub proxy: ConsumerProxy,
    pub coordinator: Arc<Coordinator>,
    pub metadata: Arc<dyn SessionMetadataStore>,
    pub auth: AuthState,
    /// Allowed CORS origins.
    pub cors_origins: Arc<Vec<String>>,
    /// Request body limit in bytes.
    pub max_body_bytes: usize,
    /// Cancelled on server shutdown; ends open live reads.
    pub shutdown: CancellationToken,
}
