//! Connection registry: per-control-channel contexts, the connection state
//! machine, and ordered teardown.
//!
//! The registry exclusively owns each [`ConnectionContext`]; tasks hold
//! `Arc` references but the context is only removed here. External service
//! handles are created during configuration and closed exactly once during
//! teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dx_domain::config::ConnectionConfig;
use dx_domain::error::{Error, Result};
use dx_domain::frame::{unix_ts, ConnectionState, Frame};
use dx_domain::turn::AssistantTurn;
use dx_providers::traits::{LlmProvider, UiProvider};
use dx_providers::OpenAiCompatClient;
use dx_sessions::SessionRegistry;
use dx_toolserver::ToolServerClient;

use crate::media::VoicePipeline;
use crate::runtime::bus::VoiceBus;
use crate::runtime::history::HistoryStore;
use crate::runtime::worker;

/// How long teardown waits for the worker to exit.
const WORKER_SHUTDOWN_WAIT: std::time::Duration = std::time::Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Metrics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ConnectionMetrics {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub tool_calls: AtomicU64,
    pub viz_requests: AtomicU64,
    pub errors: AtomicU64,
    pub dropped_frames: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub tool_calls: u64,
    pub viz_requests: u64,
    pub errors: u64,
    pub dropped_frames: u64,
}

impl ConnectionMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            viz_requests: self.viz_requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The media pipeline currently linked to a connection.
#[derive(Clone)]
pub struct VoiceLink {
    pub pipeline: Arc<dyn VoicePipeline>,
    pub media_id: String,
    pub thread_id: String,
}

/// Context for a single control-channel connection.
pub struct ConnectionContext {
    pub connection_id: String,
    state: Mutex<ConnectionState>,
    pub config: Mutex<Option<ConnectionConfig>>,

    llm: Mutex<Option<Arc<dyn LlmProvider>>>,
    tools: Mutex<Option<Arc<ToolServerClient>>>,
    ui: Mutex<Option<Arc<dyn UiProvider>>>,

    input_tx: mpsc::Sender<AssistantTurn>,
    input_rx: Mutex<Option<mpsc::Receiver<AssistantTurn>>>,
    output_tx: mpsc::Sender<Frame>,
    output_rx: Mutex<Option<mpsc::Receiver<Frame>>>,

    pub cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    voice: Mutex<Option<VoiceLink>>,

    pub metrics: ConnectionMetrics,
    pub created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
}

impl ConnectionContext {
    fn new(queue_capacity: usize) -> Self {
        let (input_tx, input_rx) = mpsc::channel(queue_capacity);
        let (output_tx, output_rx) = mpsc::channel(queue_capacity);
        let now = Utc::now();
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(ConnectionState::Connecting),
            config: Mutex::new(None),
            llm: Mutex::new(None),
            tools: Mutex::new(None),
            ui: Mutex::new(None),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            output_tx,
            output_rx: Mutex::new(Some(output_rx)),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
            voice: Mutex::new(None),
            metrics: ConnectionMetrics::default(),
            created_at: now,
            last_activity: Mutex::new(now),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Sender feeding this connection's input queue (assistant turns).
    /// Sends block when the queue is full, throttling the producer.
    pub fn turn_sender(&self) -> mpsc::Sender<AssistantTurn> {
        self.input_tx.clone()
    }

    /// Taken exactly once by the worker task.
    pub fn take_input_rx(&self) -> Option<mpsc::Receiver<AssistantTurn>> {
        self.input_rx.lock().take()
    }

    /// Taken exactly once by the sender task.
    pub fn take_output_rx(&self) -> Option<mpsc::Receiver<Frame>> {
        self.output_rx.lock().take()
    }

    /// Enqueue a frame on the output queue, blocking on backpressure.
    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.output_tx
            .send(frame)
            .await
            .map_err(|_| Error::ChannelSend("output queue closed".into()))
    }

    /// Non-blocking enqueue: drops on a full queue with a metric. Used by
    /// the bus bridge so one slow client only hurts itself.
    pub fn try_send_frame(&self, frame: Frame) {
        match self.output_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.metrics.dropped_frames.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    connection_id = %self.connection_id,
                    kind = frame.kind(),
                    "output queue full, dropping bridged frame"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn llm(&self) -> Option<Arc<dyn LlmProvider>> {
        self.llm.lock().clone()
    }

    pub fn tools(&self) -> Option<Arc<ToolServerClient>> {
        self.tools.lock().clone()
    }

    pub fn ui_provider(&self) -> Option<Arc<dyn UiProvider>> {
        self.ui.lock().clone()
    }

    pub fn voice_link(&self) -> Option<VoiceLink> {
        self.voice.lock().clone()
    }

    pub fn client_id(&self) -> String {
        self.config
            .lock()
            .as_ref()
            .map(|c| c.client_id.clone())
            .unwrap_or_else(|| "unknown".into())
    }

    pub(crate) fn set_llm(&self, llm: Arc<dyn LlmProvider>) {
        *self.llm.lock() = Some(llm);
    }

    pub(crate) fn set_tools(&self, tools: Arc<ToolServerClient>) {
        *self.tools.lock() = Some(tools);
    }

    pub(crate) fn set_ui(&self, ui: Arc<dyn UiProvider>) {
        *self.ui.lock() = Some(ui);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-connection info for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub client_id: String,
    pub state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub tool_servers: usize,
    pub viz_provider: Option<String>,
    pub has_voice: bool,
    pub voice_thread_id: Option<String>,
    pub counters: MetricsSnapshot,
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<ConnectionContext>>>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            queue_capacity,
        }
    }

    /// Register a fresh connection in `connecting` state.
    pub fn register(&self) -> Arc<ConnectionContext> {
        let ctx = Arc::new(ConnectionContext::new(self.queue_capacity));
        self.connections
            .write()
            .insert(ctx.connection_id.clone(), ctx.clone());
        tracing::info!(connection_id = %ctx.connection_id, "connection registered");
        ctx
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ConnectionContext>> {
        self.connections.read().get(connection_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn list(&self) -> Vec<Arc<ConnectionContext>> {
        self.connections.read().values().cloned().collect()
    }

    /// Transition the state machine and publish a `connection_state` frame.
    ///
    /// A channel-send failure while already heading to a terminal state is
    /// clamped: the state flips to `error` locally without another publish,
    /// so a dead channel cannot oscillate.
    pub async fn update_state(
        &self,
        ctx: &ConnectionContext,
        state: ConnectionState,
        message: &str,
        progress: Option<u8>,
    ) -> bool {
        let old_state = ctx.state();
        ctx.set_state(state);
        ctx.touch();

        let frame = Frame::ConnectionState {
            state,
            message: message.to_string(),
            progress,
            connection_id: ctx.connection_id.clone(),
            metadata: None,
            timestamp: unix_ts(),
        };

        match ctx.send_frame(frame).await {
            Ok(()) => {
                tracing::info!(
                    connection_id = %ctx.connection_id,
                    from = old_state.as_str(),
                    to = state.as_str(),
                    message,
                    "connection state changed"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    connection_id = %ctx.connection_id,
                    state = state.as_str(),
                    error = %e,
                    "failed to publish connection state"
                );
                if !matches!(
                    state,
                    ConnectionState::Error | ConnectionState::Disconnecting | ConnectionState::Closed
                ) {
                    ctx.set_state(ConnectionState::Error);
                }
                false
            }
        }
    }

    /// Run the configuration state machine: validate, build the external
    /// service handles, and spawn the worker.
    pub async fn configure(
        &self,
        ctx: &Arc<ConnectionContext>,
        config: ConnectionConfig,
        bus: &Arc<VoiceBus>,
    ) -> Result<()> {
        *ctx.config.lock() = Some(config.clone());

        self.update_state(
            ctx,
            ConnectionState::ConfigReceived,
            "Configuration received, validating...",
            None,
        )
        .await;

        self.update_state(
            ctx,
            ConnectionState::Validating,
            "Validating configuration...",
            Some(10),
        )
        .await;

        if let Err(e) = config.validate() {
            self.update_state(
                ctx,
                ConnectionState::Error,
                &format!("Configuration validation failed: {e}"),
                None,
            )
            .await;
            return Err(e);
        }

        // Tool-server client (and the LLM client it shares credentials with).
        self.update_state(
            ctx,
            ConnectionState::McpInitializing,
            "Connecting to tool servers...",
            Some(30),
        )
        .await;

        let llm: Arc<dyn LlmProvider> = match OpenAiCompatClient::from_env(
            "chat",
            None,
            &config.mcp_config.api_key_env,
            config.mcp_config.model.as_str(),
            None,
        ) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                let e = Error::ToolServerInit(e.to_string());
                self.update_state(
                    ctx,
                    ConnectionState::Error,
                    &format!("Tool server initialization failed: {e}"),
                    None,
                )
                .await;
                return Err(e);
            }
        };
        ctx.set_llm(llm);

        let tools = Arc::new(ToolServerClient::initialize(&config.mcp_config).await);
        let server_count = tools.server_count();
        ctx.set_tools(tools);

        self.update_state(
            ctx,
            ConnectionState::McpInitializing,
            &format!("Tool server client ready with {server_count} servers, setting up visualization..."),
            Some(50),
        )
        .await;

        // UI provider.
        self.update_state(
            ctx,
            ConnectionState::VizInitializing,
            &format!(
                "Setting up {} visualization provider...",
                config.visualization_provider.provider_type.as_str()
            ),
            Some(60),
        )
        .await;

        let ui = match dx_providers::create_provider(&config.visualization_provider).await {
            Ok(provider) => provider,
            Err(e) => {
                self.update_state(
                    ctx,
                    ConnectionState::Error,
                    &format!("Visualization setup failed: {e}"),
                    None,
                )
                .await;
                return Err(e);
            }
        };
        ctx.set_ui(ui);

        self.update_state(
            ctx,
            ConnectionState::VizInitializing,
            &format!(
                "Visualization provider ({}) ready, finalizing setup...",
                config.visualization_provider.provider_type.as_str()
            ),
            Some(75),
        )
        .await;

        self.update_state(
            ctx,
            ConnectionState::Ready,
            "Connection ready for chat!",
            Some(100),
        )
        .await;

        // Worker.
        let handle = worker::spawn(ctx.clone(), bus.clone());
        *ctx.worker.lock() = Some(handle);

        self.update_state(
            ctx,
            ConnectionState::Active,
            "Connection active and processing messages",
            None,
        )
        .await;

        Ok(())
    }

    /// Link a media pipeline to a connection and retarget its bus
    /// subscription at the pipeline's thread.
    pub fn register_voice(
        &self,
        ctx: &ConnectionContext,
        pipeline: Arc<dyn VoicePipeline>,
        media_id: &str,
        thread_id: &str,
        bus: &VoiceBus,
    ) {
        *ctx.voice.lock() = Some(VoiceLink {
            pipeline,
            media_id: media_id.to_string(),
            thread_id: thread_id.to_string(),
        });
        ctx.touch();
        bus.update_thread_id(&ctx.connection_id, thread_id);
        tracing::info!(
            connection_id = %ctx.connection_id,
            media_id = %media_id,
            thread_id = %thread_id,
            "voice pipeline linked"
        );
    }

    pub fn unregister_voice(&self, ctx: &ConnectionContext) -> Option<VoiceLink> {
        let link = ctx.voice.lock().take();
        if link.is_some() {
            tracing::info!(connection_id = %ctx.connection_id, "voice pipeline unlinked");
        }
        link
    }

    /// Ordered teardown. Every step is best-effort; a failing step logs and
    /// the remaining steps still run.
    pub async fn teardown(
        &self,
        ctx: &Arc<ConnectionContext>,
        bus: &VoiceBus,
        sessions: &SessionRegistry,
        history: &HistoryStore,
    ) {
        let connection_id = ctx.connection_id.clone();
        if self.connections.read().get(&connection_id).is_none() {
            return;
        }
        tracing::info!(connection_id = %connection_id, "tearing down connection");

        // 1. Announce, best-effort: the channel may already be gone.
        self.update_state(ctx, ConnectionState::Disconnecting, "Cleaning up connection...", None)
            .await;

        // 2. Cancel the worker and wait for it, bounded.
        ctx.cancel.cancel();
        let worker = ctx.worker.lock().take();
        if let Some(handle) = worker {
            if tokio::time::timeout(WORKER_SHUTDOWN_WAIT, handle).await.is_err() {
                tracing::warn!(connection_id = %connection_id, "worker did not stop within timeout");
            }
        }

        // 3. Drop bus and media linkage.
        bus.unsubscribe(&connection_id);
        if let Some(link) = self.unregister_voice(ctx) {
            sessions.unbind_media(&link.media_id);
        }
        sessions.unbind_control(&connection_id);

        // 4. Close tool server sessions.
        let tools = ctx.tools.lock().take();
        if let Some(tools) = tools {
            tools.close().await;
        }

        // 5. Clean up the UI provider.
        let ui = ctx.ui.lock().take();
        if let Some(ui) = ui {
            ui.cleanup().await;
        }

        // 6. Drain queues: dropping the receiver halves releases anything
        // still buffered (the task-owned halves are gone once the tasks
        // observe cancellation).
        ctx.input_rx.lock().take();
        ctx.output_rx.lock().take();
        history.remove_connection(&connection_id);

        // 7. Remove from the registry.
        self.connections.write().remove(&connection_id);
        ctx.set_state(ConnectionState::Closed);
        tracing::info!(connection_id = %connection_id, "connection cleaned up");
    }

    /// Evict connections idle beyond `idle_timeout`. Returns the count.
    pub async fn sweep_stale(
        &self,
        bus: &VoiceBus,
        sessions: &SessionRegistry,
        history: &HistoryStore,
        idle_timeout: std::time::Duration,
    ) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(idle_timeout).unwrap_or_default();
        let stale: Vec<Arc<ConnectionContext>> = self
            .connections
            .read()
            .values()
            .filter(|ctx| ctx.last_activity() < cutoff)
            .cloned()
            .collect();

        for ctx in &stale {
            tracing::info!(connection_id = %ctx.connection_id, "evicting stale connection");
            self.teardown(ctx, bus, sessions, history).await;
        }
        stale.len()
    }

    pub fn metrics(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .values()
            .map(|ctx| {
                let config = ctx.config.lock();
                ConnectionInfo {
                    connection_id: ctx.connection_id.clone(),
                    client_id: config
                        .as_ref()
                        .map(|c| c.client_id.clone())
                        .unwrap_or_else(|| "unknown".into()),
                    state: ctx.state(),
                    created_at: ctx.created_at,
                    last_activity: ctx.last_activity(),
                    tool_servers: ctx.tools().map(|t| t.server_count()).unwrap_or(0),
                    viz_provider: config
                        .as_ref()
                        .map(|c| c.visualization_provider.provider_type.as_str().to_string()),
                    has_voice: ctx.voice_link().is_some(),
                    voice_thread_id: ctx.voice_link().map(|l| l.thread_id),
                    counters: ctx.metrics.snapshot(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(8)
    }

    #[tokio::test]
    async fn register_starts_connecting() {
        let reg = registry();
        let ctx = reg.register();
        assert_eq!(ctx.state(), ConnectionState::Connecting);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(&ctx.connection_id).is_some());
    }

    #[tokio::test]
    async fn update_state_publishes_frame() {
        let reg = registry();
        let ctx = reg.register();
        let mut output = ctx.take_output_rx().unwrap();

        assert!(
            reg.update_state(&ctx, ConnectionState::ConfigReceived, "got config", Some(10))
                .await
        );
        assert_eq!(ctx.state(), ConnectionState::ConfigReceived);

        match output.recv().await.unwrap() {
            Frame::ConnectionState { state, progress, connection_id, .. } => {
                assert_eq!(state, ConnectionState::ConfigReceived);
                assert_eq!(progress, Some(10));
                assert_eq!(connection_id, ctx.connection_id);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_failure_clamps_to_error_without_oscillation() {
        let reg = registry();
        let ctx = reg.register();
        // Simulate a dead channel: drop the output receiver.
        drop(ctx.take_output_rx().unwrap());

        assert!(
            !reg.update_state(&ctx, ConnectionState::Ready, "ready", None)
                .await
        );
        assert_eq!(ctx.state(), ConnectionState::Error);

        // A failing publish of `error` itself must not loop or panic.
        assert!(
            !reg.update_state(&ctx, ConnectionState::Error, "bad", None)
                .await
        );
        assert_eq!(ctx.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn try_send_frame_drops_when_full() {
        let reg = ConnectionRegistry::new(1);
        let ctx = reg.register();
        let _rx = ctx.take_output_rx().unwrap();

        ctx.try_send_frame(Frame::ChatDone { id: "a".into(), content: None });
        ctx.try_send_frame(Frame::ChatDone { id: "b".into(), content: None });
        assert_eq!(ctx.metrics.dropped_frames.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn teardown_removes_and_closes() {
        let reg = registry();
        let bus = VoiceBus::new();
        let sessions = SessionRegistry::new();
        let history = HistoryStore::new();

        let ctx = reg.register();
        sessions.bind_control("S", &ctx.connection_id, "T");
        let _bus_rx = bus.subscribe(&ctx.connection_id, None, 4);
        history.add_user(&ctx.connection_id, "T", "hi");

        reg.teardown(&ctx, &bus, &sessions, &history).await;

        assert_eq!(reg.len(), 0);
        assert_eq!(ctx.state(), ConnectionState::Closed);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(history.recent(&ctx.connection_id, "T").is_empty());
        // Control binding released.
        assert_eq!(sessions.media_for_control(&ctx.connection_id), None);
        assert!(sessions.get("S").unwrap().control_id.is_none());

        // Teardown is idempotent.
        reg.teardown(&ctx, &bus, &sessions, &history).await;
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_connections() {
        let reg = registry();
        let bus = VoiceBus::new();
        let sessions = SessionRegistry::new();
        let history = HistoryStore::new();

        let idle = reg.register();
        let fresh = reg.register();
        *idle.last_activity.lock() = Utc::now() - chrono::Duration::hours(2);

        let evicted = reg
            .sweep_stale(&bus, &sessions, &history, std::time::Duration::from_secs(3600))
            .await;
        assert_eq!(evicted, 1);
        assert!(reg.get(&idle.connection_id).is_none());
        assert!(reg.get(&fresh.connection_id).is_some());
    }
}
