//! Media-channel handler.
//!
//! POST /api/offer accepts a media offer, creates or renegotiates the voice
//! pipeline, and links it to the owning connection: a supplied session id is
//! bound in the session registry and resolved to the linked control channel,
//! or the client names the control channel directly via
//! `backend_connection_id`.

use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use dx_domain::error::Error;

use crate::media::{MediaChannel, MediaOffer, MediaWiring};
use crate::state::AppState;

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into(), "error_code": code })),
    )
        .into_response()
}

/// POST /api/offer
pub async fn handle_offer(
    State(state): State<AppState>,
    Json(offer): Json<MediaOffer>,
) -> Response {
    // Known pc_id: renegotiate the existing channel.
    if let Some(pc_id) = &offer.pc_id {
        if let Some(channel) = state.media.get(pc_id) {
            tracing::info!(pc_id = %pc_id, "renegotiating media channel");
            return match channel
                .pipeline
                .renegotiate(&offer.sdp, &offer.sdp_type, offer.restart_pc)
                .await
            {
                Ok(answer) => Json(answer).into_response(),
                Err(e) => api_error(StatusCode::BAD_GATEWAY, e.code(), e.to_string()),
            };
        }
    }

    let pc_id = offer
        .pc_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let thread_id = offer.thread_id.clone().unwrap_or_else(|| "main".into());

    // Session linkage resolves the owning control channel.
    let mut linked_control = None;
    if let Some(session_id) = &offer.session_id {
        if let Err(e) = state.sessions.bind_media(session_id, &pc_id, &thread_id) {
            tracing::warn!(session_id = %session_id, error = %e, "media bind rejected");
            return api_error(StatusCode::NOT_FOUND, e.code(), e.to_string());
        }
        linked_control = state.sessions.control_for_media(&pc_id);
    }

    let target = offer.backend_connection_id.clone().or(linked_control);
    let Some(connection_id) = target else {
        state.sessions.unbind_media(&pc_id);
        return api_error(
            StatusCode::BAD_REQUEST,
            "session_not_found",
            "offer resolves to no control channel",
        );
    };
    let Some(ctx) = state.connections.get(&connection_id) else {
        state.sessions.unbind_media(&pc_id);
        return api_error(
            StatusCode::NOT_FOUND,
            "session_not_found",
            format!("linked control channel {connection_id} is not connected"),
        );
    };

    let closed = tokio_util::sync::CancellationToken::new();
    let wiring = MediaWiring {
        turn_tx: ctx.turn_sender(),
        bus: state.bus.clone(),
        connection_id: connection_id.clone(),
        thread_id: thread_id.clone(),
        closed: closed.clone(),
    };

    match state
        .pipeline_factory
        .accept_offer(&offer, &pc_id, wiring)
        .await
    {
        Ok((answer, pipeline)) => {
            state.media.insert(
                &pc_id,
                MediaChannel {
                    pipeline: pipeline.clone(),
                    session_id: offer.session_id.clone(),
                    connection_id: connection_id.clone(),
                    closed: closed.clone(),
                },
            );
            state
                .connections
                .register_voice(&ctx, pipeline, &pc_id, &thread_id, &state.bus);

            // Unwind the channel's registrations when the pipeline reports
            // closure through the wiring token.
            let watch_state = state.clone();
            let watch_pc = pc_id.clone();
            tokio::spawn(async move {
                closed.cancelled().await;
                close_media_channel(&watch_state, &watch_pc).await;
            });

            tracing::info!(
                pc_id = %pc_id,
                connection_id = %connection_id,
                thread_id = %thread_id,
                "media channel established"
            );
            Json(answer).into_response()
        }
        Err(e) => {
            state.sessions.unbind_media(&pc_id);
            tracing::error!(error = %e, "failed to build media pipeline");
            let status = match e {
                Error::Other(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            api_error(status, e.code(), e.to_string())
        }
    }
}

/// Close one media channel and unwind its registrations: the pipeline is
/// closed, the session's media binding is released, and the owning
/// connection's voice link is cleared. Dispatched by the per-channel watcher
/// when the pipeline cancels its wiring token, and per channel on process
/// shutdown. Idempotent: a second call for the same `pc_id` is a no-op.
pub async fn close_media_channel(state: &AppState, pc_id: &str) {
    let Some(channel) = state.media.remove(pc_id) else {
        return;
    };
    // Wake the watcher so it exits when closure was initiated gateway-side.
    channel.closed.cancel();
    channel.pipeline.close().await;
    state.sessions.unbind_media(pc_id);

    if let Some(ctx) = state.connections.get(&channel.connection_id) {
        let still_linked = ctx.voice_link().is_some_and(|link| link.media_id == pc_id);
        if still_linked {
            state.connections.unregister_voice(&ctx);
        }
    }
    tracing::info!(pc_id = %pc_id, "media channel closed");
}
