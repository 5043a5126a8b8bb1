use std::sync::Arc;

use dx_sessions::SessionRegistry;

use crate::api::interaction::DedupeStore;
use crate::config::GatewayConfig;
use crate::media::{MediaRegistry, VoicePipelineFactory};
use crate::runtime::bus::VoiceBus;
use crate::runtime::connections::ConnectionRegistry;
use crate::runtime::history::HistoryStore;

/// Shared application state passed to all handlers.
///
/// The session registry, connection registry, and fan-out bus are the only
/// mutable cross-tenant structures; everything per-connection lives inside
/// its [`ConnectionContext`](crate::runtime::connections::ConnectionContext).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub bus: Arc<VoiceBus>,
    pub history: Arc<HistoryStore>,
    pub dedupe: Arc<DedupeStore>,
    pub media: Arc<MediaRegistry>,
    /// Supplied by the embedding application; builds voice pipelines.
    pub pipeline_factory: Arc<dyn VoicePipelineFactory>,
}

impl AppState {
    pub fn new(config: GatewayConfig, pipeline_factory: Arc<dyn VoicePipelineFactory>) -> Self {
        let queue_capacity = config.queue_capacity;
        Self {
            config: Arc::new(config),
            sessions: Arc::new(SessionRegistry::new()),
            connections: Arc::new(ConnectionRegistry::new(queue_capacity)),
            bus: Arc::new(VoiceBus::new()),
            history: Arc::new(HistoryStore::new()),
            dedupe: Arc::new(DedupeStore::new(std::time::Duration::from_secs(5))),
            media: Arc::new(MediaRegistry::new()),
            pipeline_factory,
        }
    }
}
