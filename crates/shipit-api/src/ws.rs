//! WebSocket gateway for live build logs.
//!
//! A client sends `{"build_id": "<id>"}` and from then on receives every log
//! payload published for that build, verbatim. Sending another id replaces
//! the subscription.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Value, json};
use shipit_core::BuildId;
use shipit_core::bus::{LogBus, LogSubscription};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.bus))
}

/// What a client message asked for.
#[derive(Debug, PartialEq, Eq)]
enum ClientRequest {
    Subscribe(String),
    MissingBuildId,
    InvalidJson,
}

fn parse_request(text: &str) -> ClientRequest {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return ClientRequest::InvalidJson;
    };
    let id = value
        .get("build_id")
        .or_else(|| value.get("buildId"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty());
    match id {
        Some(id) => ClientRequest::Subscribe(id.to_string()),
        None => ClientRequest::MissingBuildId,
    }
}

fn error_frame(message: &str) -> Message {
    Message::Text(json!({ "error": message }).to_string().into())
}

/// Next payload of the current subscription; pending forever without one.
async fn next_payload(subscription: &mut Option<LogSubscription>) -> Option<String> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_socket(socket: WebSocket, bus: Arc<dyn LogBus>) {
    info!("WebSocket connection established");
    let (sender, receiver) = socket.split();
    run_session(receiver, sender, bus).await;
    info!("WebSocket connection closed");
}

/// Serve one client until it goes away. Requests arrive on `incoming`;
/// replies and log payloads leave on `outgoing`.
async fn run_session<I, O, E>(mut incoming: I, mut outgoing: O, bus: Arc<dyn LogBus>)
where
    I: Stream<Item = Result<Message, E>> + Unpin,
    O: Sink<Message> + Unpin,
    E: std::fmt::Display,
{
    let mut subscription: Option<LogSubscription> = None;

    loop {
        tokio::select! {
            msg = incoming.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_request(parse_request(text.as_str()), &bus, &mut subscription).await
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };
                if outgoing.send(reply).await.is_err() {
                    break;
                }
            }
            payload = next_payload(&mut subscription) => {
                match payload {
                    Some(payload) => {
                        if outgoing.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    // The bus went away; wait for the client to resubscribe.
                    None => subscription = None,
                }
            }
        }
    }
    // Dropping `subscription` unsubscribes.
}

async fn handle_request(
    request: ClientRequest,
    bus: &Arc<dyn LogBus>,
    subscription: &mut Option<LogSubscription>,
) -> Message {
    let raw = match request {
        ClientRequest::Subscribe(raw) => raw,
        ClientRequest::MissingBuildId => return error_frame("Missing build_id in message"),
        ClientRequest::InvalidJson => return error_frame("Invalid JSON message"),
    };

    // Only one build per connection: release the old one before the new
    // one can deliver anything.
    if let Some(mut previous) = subscription.take() {
        debug!(job_id = %previous.build_id(), "Dropping previous subscription");
        previous.unsubscribe();
    }

    let id = match BuildId::parse(&raw) {
        Ok(id) => id,
        Err(e) => {
            warn!(build_id = %raw, error = %e, "Rejected subscription");
            return error_frame("Failed to subscribe");
        }
    };

    match bus.subscribe(&id).await {
        Ok(sub) => {
            info!(job_id = %id, "Client subscribed");
            *subscription = Some(sub);
            Message::Text(
                json!({ "message": format!("Subscribed to build {}", id) })
                    .to_string()
                    .into(),
            )
        }
        Err(e) => {
            warn!(job_id = %id, error = %e, "Failed to subscribe");
            error_frame("Failed to subscribe")
        }
    }
}
