//! Control-channel handler.
//!
//! Flow per connection:
//! 1. Accept the WebSocket, assign a fresh connection id, start the sender
//!    task, and send `connection_established`.
//! 2. Await the `connection_config` frame (30 s deadline) and run the
//!    configuration state machine, which spawns the worker.
//! 3. Run the bus-bridge task and the receiver loop; whichever finishes
//!    first cancels the others and triggers ordered teardown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};

use dx_domain::config::ConnectionConfig;
use dx_domain::error::Error;
use dx_domain::frame::{ClientFrame, Frame, InteractionKind, MAX_MESSAGE_LEN};
use dx_domain::turn::{AssistantTurn, TurnSource};
use dx_providers::chat::chat_with_tools;

use crate::api::interaction;
use crate::runtime::connections::ConnectionContext;
use crate::runtime::worker;
use crate::state::AppState;

/// GET /ws/messages — upgrade to the control channel.
pub async fn control_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let ctx = state.connections.register();
    let connection_id = ctx.connection_id.clone();

    // Sender task: drains the output queue into the websocket. Runs from the
    // very first frame so the state machine can publish during the handshake.
    let Some(mut output_rx) = ctx.take_output_rx() else {
        tracing::error!(connection_id = %connection_id, "output queue already taken");
        return;
    };
    let sender_ctx = ctx.clone();
    let sender = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sender_ctx.cancel.cancelled() => break,
                frame = output_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to serialize frame");
                            continue;
                        }
                    };
                    if ws_sink.send(WsMessage::Text(json)).await.is_err() {
                        tracing::warn!(
                            connection_id = %sender_ctx.connection_id,
                            "control channel write failed"
                        );
                        sender_ctx.cancel.cancel();
                        break;
                    }
                    sender_ctx.touch();
                }
            }
        }
        tracing::debug!(connection_id = %sender_ctx.connection_id, "sender stopped");
    });

    if ctx
        .send_frame(Frame::connection_established(connection_id.as_str()))
        .await
        .is_err()
    {
        finish(&state, &ctx, sender, None).await;
        return;
    }

    // Configuration handshake.
    let config = match wait_for_configuration(&state, &ctx, &mut ws_stream).await {
        Some(config) => config,
        None => {
            finish(&state, &ctx, sender, None).await;
            return;
        }
    };

    if state
        .connections
        .configure(&ctx, config.clone(), &state.bus)
        .await
        .is_err()
    {
        finish(&state, &ctx, sender, None).await;
        return;
    }

    // Bind the persistent session so media offers can route here.
    if let Some(session_id) = &config.session_id {
        let thread_id = config.thread_id.as_deref().unwrap_or("main");
        state
            .sessions
            .bind_control(session_id, &connection_id, thread_id);
    }

    // Bus bridge: forwards broadcast voice frames into the output queue,
    // non-blocking.
    let mut bus_rx = state.bus.subscribe(
        &connection_id,
        config.thread_id.clone(),
        state.config.queue_capacity,
    );
    let bridge_ctx = ctx.clone();
    let bridge = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = bridge_ctx.cancel.cancelled() => break,
                frame = bus_rx.recv() => {
                    let Some(frame) = frame else { break };
                    bridge_ctx.try_send_frame(frame);
                }
            }
        }
        tracing::debug!(connection_id = %bridge_ctx.connection_id, "bus bridge stopped");
    });

    // Receiver loop: inbound frames are processed strictly sequentially.
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            msg = ws_stream.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    ctx.touch();
                    handle_client_frame(&state, &ctx, &text).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    tracing::info!(connection_id = %connection_id, "control channel closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "control channel read error");
                    break;
                }
            }
        }
    }

    finish(&state, &ctx, sender, Some(bridge)).await;
}

/// Cancel sibling tasks and run ordered teardown.
async fn finish(
    state: &AppState,
    ctx: &Arc<ConnectionContext>,
    sender: tokio::task::JoinHandle<()>,
    bridge: Option<tokio::task::JoinHandle<()>>,
) {
    ctx.cancel.cancel();
    state
        .connections
        .teardown(ctx, &state.bus, &state.sessions, &state.history)
        .await;
    state.dedupe.remove_connection(&ctx.connection_id);
    sender.abort();
    if let Some(bridge) = bridge {
        bridge.abort();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handshake
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn wait_for_configuration(
    state: &AppState,
    ctx: &Arc<ConnectionContext>,
    ws_stream: &mut SplitStream<WebSocket>,
) -> Option<ConnectionConfig> {
    let deadline = state.config.config_timeout;
    let connection_id = ctx.connection_id.clone();

    let text = loop {
        let msg = match tokio::time::timeout(deadline, ws_stream.next()).await {
            Ok(msg) => msg,
            Err(_) => {
                let e = Error::ConfigTimeout;
                let _ = ctx
                    .send_frame(Frame::error(
                        "Configuration timeout. Please send config within 30 seconds.",
                        Some(e.code()),
                        Some(connection_id.as_str()),
                    ))
                    .await;
                return None;
            }
        };
        match msg {
            Some(Ok(WsMessage::Text(text))) => break text,
            Some(Ok(WsMessage::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "read error during handshake");
                return None;
            }
        }
    };

    match serde_json::from_str::<ClientFrame>(&text) {
        Ok(ClientFrame::ConnectionConfig { config }) => Some(config),
        Ok(_) | Err(_) => {
            let _ = ctx
                .send_frame(Frame::error(
                    "Invalid configuration format: expected a connection_config frame",
                    Some("invalid_config_format"),
                    Some(connection_id.as_str()),
                ))
                .await;
            None
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_client_frame(state: &AppState, ctx: &Arc<ConnectionContext>, text: &str) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(
                connection_id = %ctx.connection_id,
                error = %e,
                "ignoring unparseable client frame"
            );
            return;
        }
    };

    match frame {
        ClientFrame::Chat {
            message, thread_id, ..
        } => {
            if message.trim().is_empty() || message.len() > MAX_MESSAGE_LEN {
                tracing::warn!(
                    connection_id = %ctx.connection_id,
                    len = message.len(),
                    "ignoring out-of-bounds chat message"
                );
                return;
            }
            process_chat(state, ctx, &message, thread_id, false).await;
        }
        ClientFrame::ThesysBridge { prompt, thread_id, .. } => {
            let message = prompt
                .get("content")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string();
            if message.is_empty() {
                tracing::warn!(connection_id = %ctx.connection_id, "bridge prompt has no content");
                return;
            }
            process_chat(state, ctx, &message, thread_id, true).await;
        }
        ClientFrame::UserInteraction {
            interaction_type,
            context,
            ..
        } => {
            process_interaction(state, ctx, interaction_type, context).await;
        }
        ClientFrame::ConnectionConfig { .. } => {
            tracing::warn!(
                connection_id = %ctx.connection_id,
                "ignoring duplicate connection_config"
            );
        }
    }
}

/// Run a text turn: tool-aware LLM call, history update, then hand the
/// response to the worker through the input queue (blocking on backpressure,
/// so a slow tenant throttles its own upstream).
async fn process_chat(
    state: &AppState,
    ctx: &Arc<ConnectionContext>,
    message: &str,
    thread_id: Option<String>,
    is_action: bool,
) {
    let thread_id = thread_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let connection_id = &ctx.connection_id;
    tracing::info!(
        connection_id = %connection_id,
        thread_id = %thread_id,
        is_action,
        "processing chat turn"
    );

    let (Some(llm), Some(tools)) = (ctx.llm(), ctx.tools()) else {
        send_chat_error(ctx, &thread_id, "connection is not fully configured").await;
        return;
    };

    // History snapshot before this turn; the wrapper appends the new message.
    let history = state.history.recent(connection_id, &thread_id);
    if is_action {
        state.history.add_action(connection_id, &thread_id, message);
    } else {
        state.history.add_user(connection_id, &thread_id, message);
    }

    match chat_with_tools(&llm, &tools, message, &history).await {
        Ok(response) => {
            state
                .history
                .add_assistant(connection_id, &thread_id, &response);
            let updated = state.history.recent(connection_id, &thread_id);
            let turn = AssistantTurn::new(
                response,
                updated,
                TurnSource::Text,
                connection_id.clone(),
                Some(thread_id),
            );
            if ctx.turn_sender().send(turn).await.is_err() {
                tracing::warn!(connection_id = %connection_id, "input queue closed, dropping turn");
            }
        }
        Err(e) => {
            tracing::error!(connection_id = %connection_id, error = %e, "chat turn failed");
            ctx.metrics.errors.fetch_add(1, Ordering::Relaxed);
            send_chat_error(ctx, &thread_id, &format!("Failed to process your message: {e}")).await;
        }
    }
}

/// Per-turn failures render as a framework-appropriate error card; the
/// connection stays active.
async fn send_chat_error(ctx: &Arc<ConnectionContext>, thread_id: &str, description: &str) {
    let (content_type, framework, body) = worker::render_body(ctx, description, true);
    let frame = Frame::TextChatResponse {
        id: uuid::Uuid::new_v4().to_string(),
        role: "assistant".into(),
        content: body,
        thread_id: Some(thread_id.to_string()),
        content_type: Some(content_type),
        framework: Some(framework),
    };
    if let Err(e) = ctx.send_frame(frame).await {
        tracing::error!(connection_id = %ctx.connection_id, error = %e, "failed to send chat error");
    }
}

async fn process_interaction(
    state: &AppState,
    ctx: &Arc<ConnectionContext>,
    kind: InteractionKind,
    context: serde_json::Value,
) {
    let connection_id = &ctx.connection_id;

    if state.dedupe.is_duplicate(connection_id, kind, &context) {
        tracing::info!(
            connection_id = %connection_id,
            kind = kind.as_str(),
            "duplicate interaction suppressed"
        );
        return;
    }

    if let Some(framework) = interaction::detect_framework(&context) {
        tracing::debug!(
            connection_id = %connection_id,
            framework = framework.as_str(),
            "framework detected from interaction"
        );
    }

    // A stable per-connection thread keeps interaction turns from
    // fragmenting into one thread per click.
    let thread_id = format!("{connection_id}:main_thread");
    let display_text = interaction::user_message(kind, &context);
    tracing::info!(
        connection_id = %connection_id,
        kind = kind.as_str(),
        interaction_display = %display_text,
        "user interaction"
    );

    // Show the interaction in chat as if the user typed it.
    let user_frame = Frame::TextChatResponse {
        id: uuid::Uuid::new_v4().to_string(),
        role: "user".into(),
        content: display_text.clone(),
        thread_id: Some(thread_id.clone()),
        content_type: None,
        framework: None,
    };
    if ctx.send_frame(user_frame).await.is_err() {
        return;
    }
    state.history.add_user(connection_id, &thread_id, &display_text);

    // Input changes are displayed but never trigger an AI turn.
    if matches!(kind, InteractionKind::FormSubmit | InteractionKind::ButtonClick) {
        let ai_message = interaction::ai_context(kind, &context);
        process_chat(state, ctx, &ai_message, Some(thread_id), false).await;
    }
}
