//! Media-channel seam.
//!
//! The voice pipeline itself (STT, LLM, TTS, VAD) is an external
//! collaborator. The gateway only requires two things of it: at the end of
//! each assistant utterance it enqueues an [`AssistantTurn`] with
//! `source=media` through the wiring it was given, and it exposes an
//! inject-voice-over entry point that speaks supplied text as part of the
//! current or next TTS segment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dx_domain::error::{Error, Result};
use dx_domain::turn::AssistantTurn;

use crate::runtime::bus::VoiceBus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Offer / answer wire types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaOffer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pc_id: Option<String>,
    #[serde(default)]
    pub restart_pc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub pc_id: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a pipeline implementation needs to hand events back to the
/// owning connection.
#[derive(Clone)]
pub struct MediaWiring {
    /// Enqueues assistant turns into the owning connection's input queue.
    /// Sends block when the queue is full, throttling the pipeline.
    pub turn_tx: mpsc::Sender<AssistantTurn>,
    /// For voice-originated frames (user transcriptions, voice responses).
    pub bus: Arc<VoiceBus>,
    pub connection_id: String,
    pub thread_id: String,
    /// Cancelled by the pipeline when the media channel closes; the gateway
    /// then unwinds the channel's session and voice registrations.
    pub closed: CancellationToken,
}

/// A live media channel.
#[async_trait]
pub trait VoicePipeline: Send + Sync {
    /// Speak the supplied text as part of the current or next TTS segment.
    async fn inject_voice_over(&self, text: &str) -> Result<()>;

    /// Apply a renegotiation offer to the existing channel.
    async fn renegotiate(&self, sdp: &str, sdp_type: &str, restart: bool) -> Result<MediaAnswer>;

    async fn close(&self);
}

/// Builds pipelines from media offers. Supplied by the embedding
/// application; the gateway core never constructs a concrete pipeline.
#[async_trait]
pub trait VoicePipelineFactory: Send + Sync {
    async fn accept_offer(
        &self,
        offer: &MediaOffer,
        pc_id: &str,
        wiring: MediaWiring,
    ) -> Result<(MediaAnswer, Arc<dyn VoicePipeline>)>;
}

/// Placeholder factory for deployments without a voice backend: every offer
/// is rejected with a recoverable error.
pub struct UnconfiguredFactory;

#[async_trait]
impl VoicePipelineFactory for UnconfiguredFactory {
    async fn accept_offer(
        &self,
        _offer: &MediaOffer,
        _pc_id: &str,
        _wiring: MediaWiring,
    ) -> Result<(MediaAnswer, Arc<dyn VoicePipeline>)> {
        Err(Error::Other("no media pipeline backend configured".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Media registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MediaChannel {
    pub pipeline: Arc<dyn VoicePipeline>,
    pub session_id: Option<String>,
    pub connection_id: String,
    /// Shared with the pipeline's [`MediaWiring`]; cancelled on closure from
    /// either side.
    pub closed: CancellationToken,
}

/// Live media channels by `pc_id`.
#[derive(Default)]
pub struct MediaRegistry {
    channels: Mutex<HashMap<String, Arc<MediaChannel>>>,
}

impl MediaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pc_id: &str, channel: MediaChannel) {
        self.channels
            .lock()
            .insert(pc_id.to_string(), Arc::new(channel));
    }

    pub fn get(&self, pc_id: &str) -> Option<Arc<MediaChannel>> {
        self.channels.lock().get(pc_id).cloned()
    }

    pub fn remove(&self, pc_id: &str) -> Option<Arc<MediaChannel>> {
        self.channels.lock().remove(pc_id)
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Ids of all live channels.
    pub fn pc_ids(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }
}
