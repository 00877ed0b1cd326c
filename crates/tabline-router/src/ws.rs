//! WebSocket connection handling for the runtime router (SPEC_FULL §4.5).
//!
//! Each connection multiplexes two directions: inbound frames are parsed as
//! `InboundMessage` and handed to `dispatch::route_message`, whose envelope
//! is sent straight back; once a message names a `sessionId`, the connection
//! also subscribes to that session's live event broadcast and forwards every
//! `RuntimeEvent` it sees for as long as the socket stays open.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tabline_core::{InboundMessage, SessionId};
use tokio::sync::broadcast;
use tracing::warn;

use crate::app::AppState;
use crate::dispatch::route_message;

pub async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut subscribed: Option<SessionId> = None;
    let mut events: Option<broadcast::Receiver<tabline_core::RuntimeEvent>> = None;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(inbound) = serde_json::from_str::<InboundMessage>(&text) else {
                            warn!("unparseable router message: {}", &text[..text.len().min(200)]);
                            continue;
                        };

                        if let Some(session_id) = inbound.session_id.clone() {
                            let id = SessionId::new(session_id);
                            if subscribed.as_ref() != Some(&id) {
                                events = Some(state.events.subscribe(&id));
                                subscribed = Some(id);
                            }
                        }

                        let response = route_message(&state, inbound).await;
                        if let Ok(json) = serde_json::to_string(&response) {
                            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = ws_tx.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return,
                    Some(Err(e)) => {
                        warn!("websocket error: {}", e);
                        return;
                    }
                    _ => {}
                }
            }

            event = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Ok(event) => {
                        let frame = serde_json::json!({
                            "name": event.name,
                            "sessionId": event.session_id,
                            "data": event.data,
                        });
                        if let Ok(json) = serde_json::to_string(&frame) {
                            if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("client lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        events = None;
                    }
                }
            }
        }
    }
}
