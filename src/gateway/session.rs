/// Gateway / session handler
///
/// `GET /ws?token=...` upgrades to a WebSocket, verifies the token and registers
/// the channel under the token's subject. Each session runs two tasks: a writer
/// draining the channel's bounded FIFO queue into the socket and a reader
/// handling inbound frames. Sessions never block one another or the registry.

use crate::{
    api::state::AppState,
    error::AuthError,
    realtime::{
        events::{InboundMessage, NotificationEvent, OutboundMessage},
        registry::ChannelHandle,
    },
};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How long a closing session waits for its writer to flush
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
}

/// WebSocket upgrade endpoint
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    let verified = match params.token.as_deref().map(str::trim) {
        None | Some("") => Err(AuthError::MissingToken),
        Some(token) => state.verifier.verify(token),
    };

    ws.on_upgrade(move |socket| async move {
        match verified {
            Ok(identity) => run_session(socket, identity.user_id, state).await,
            Err(err) => reject(socket, err).await,
        }
    })
}

/// Close an unauthenticated socket with a policy-violation frame
async fn reject(mut socket: WebSocket, err: AuthError) {
    tracing::warn!("🔒 Rejecting real-time connection: {}", err);
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: err.to_string().into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Client went away before the close frame");
    }
}

/// Reply to one inbound frame, if any
pub fn handle_inbound(identity: &str, payload: &[u8]) -> Option<OutboundMessage> {
    match serde_json::from_slice::<InboundMessage>(payload) {
        Ok(message) if message.kind.eq_ignore_ascii_case("PING") => Some(OutboundMessage::pong()),
        Ok(message) => {
            tracing::debug!(identity, kind = %message.kind, data = %message.data, "📥 Inbound message");
            None
        }
        Err(e) => {
            tracing::debug!(identity, error = %e, "Malformed inbound message");
            Some(NotificationEvent::error(identity, format!("Invalid message format: {}", e)).to_message())
        }
    }
}

/// Register a fresh channel for `identity`
pub fn open_channel(state: &AppState, identity: &str) -> (ChannelHandle, mpsc::Receiver<OutboundMessage>) {
    let (handle, outbound) = ChannelHandle::new(identity, state.channel_buffer);
    state.connections.register(handle.clone());
    (handle, outbound)
}

async fn run_session(socket: WebSocket, identity: String, state: AppState) {
    let (handle, outbound) = open_channel(&state, &identity);
    let channel_id = handle.id;
    let (sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(write_loop(sink, outbound, state.shutdown.clone()));
    let mut shutdown = state.shutdown.clone();

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            frame = stream.next() => {
                let payload = match frame {
                    Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(identity = %identity, channel_id = %channel_id, error = %e, "WebSocket error");
                        break;
                    }
                };
                if let Some(reply) = handle_inbound(&identity, &payload) {
                    if let Err(failure) = handle.try_deliver(reply) {
                        tracing::warn!("⚠️ {}", failure);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    // Dropping the last sender lets the writer drain and exit
    state.connections.deregister(channel_id);
    drop(handle);
    if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    tracing::info!(
        identity = %identity,
        channel_id = %channel_id,
        live = state.connections.connection_count(),
        "👋 Session closed"
    );
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => {
                    if sink.send(Message::Text(message.to_json().into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: "Server shutting down".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;
    use serde_json::json;

    #[test]
    fn ping_gets_a_pong() {
        let reply = handle_inbound("u-1", br#"{"type":"PING"}"#).unwrap();
        assert_eq!(reply.kind, "PONG");
        assert_eq!(reply.data, json!({}));
    }

    #[test]
    fn informational_messages_get_no_reply() {
        assert!(handle_inbound("u-1", br#"{"type":"VIEWING","data":{"workflowId":"wf-1"}}"#).is_none());
    }

    #[test]
    fn malformed_json_gets_an_error_frame() {
        let reply = handle_inbound("u-1", b"{not json").unwrap();
        assert_eq!(reply.kind, "ERROR");
        assert!(reply.data["message"].as_str().unwrap().starts_with("Invalid message format"));
    }

    #[tokio::test]
    async fn opened_channels_receive_dispatches() {
        let harness = test_state().await;
        let state = &harness.state;
        let (tab1, mut rx1) = open_channel(state, "u-1");
        let (_tab2, mut rx2) = open_channel(state, "u-1");

        state.dispatcher.notify_new_assignment("u-1", "wf-1");
        assert_eq!(rx1.recv().await.unwrap().kind, "NEW_ASSIGNMENT");
        assert_eq!(rx2.recv().await.unwrap().kind, "NEW_ASSIGNMENT");

        state.connections.deregister(tab1.id);
        assert_eq!(state.connections.channels_for("u-1").len(), 1);
    }
}
