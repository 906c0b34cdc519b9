//! WebSocket relay to the upstream container (spec §4.J step 6). The
//! upgrade handshake always completes before any policy decision is acted
//! on -- WebSockets cannot carry an HTML status page, so a disallowed
//! connection is accepted and then closed with the policy-violation code
//! rather than rejected at the HTTP layer.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

use codehub_core::ids::WorkspaceId;
use codehub_core::retry::{classify_http_status, Backoff, ErrorClass};

use crate::state::AppState;

const MAX_RETRIES: u32 = 2;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(2);

/// What the handler decided before the upgrade completed.
pub enum WsOutcome {
    Allow { workspace_id: WorkspaceId },
    Close { code: u16, reason: &'static str },
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}

/// The handshake response carries an HTTP status when the upstream rejects
/// the upgrade; a plain connection failure (container not listening yet)
/// has none and is treated as transient, same as a bare connect timeout.
fn classify_ws_connect_error(err: &tokio_tungstenite::tungstenite::Error) -> ErrorClass {
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            classify_http_status(response.status().as_u16())
        }
        _ => ErrorClass::Transient,
    }
}

/// Retries a transient upgrade failure with jittered backoff, through the
/// same classifier WC's circuit breaker and the HTTP relay use (spec §7).
async fn connect_with_retry(
    url: &str,
) -> tokio_tungstenite::tungstenite::Result<(
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::handshake::client::Response,
)> {
    let mut backoff = Backoff::new(RETRY_BASE, RETRY_CAP);
    let mut attempt = 0;
    loop {
        match tokio_tungstenite::connect_async(url).await {
            Ok(pair) => return Ok(pair),
            Err(err) if attempt < MAX_RETRIES && classify_ws_connect_error(&err) == ErrorClass::Transient => {
                attempt += 1;
                tracing::warn!(error = %err, url, attempt, "transient websocket upstream connect failure, retrying");
                tokio::time::sleep(backoff.next_delay()).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs after the 101 upgrade response has been sent. Closes immediately if
/// policy disallowed the connection; otherwise dials the upstream container
/// and relays frames until either side disconnects.
pub async fn handle(mut socket: WebSocket, state: AppState, outcome: WsOutcome, rest: String) {
    let workspace_id = match outcome {
        WsOutcome::Allow { workspace_id } => workspace_id,
        WsOutcome::Close { code, reason } => {
            close_with(&mut socket, code, reason).await;
            return;
        }
    };

    let upstream = match state.runtime.get_upstream(workspace_id).await {
        Ok(Some(addr)) => addr,
        Ok(None) => {
            close_with(&mut socket, 1011, "Upstream unavailable").await;
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, %workspace_id, "failed to resolve websocket upstream");
            close_with(&mut socket, 1011, "Upstream unavailable").await;
            return;
        }
    };

    state.activity.record(workspace_id);
    let url = format!("ws://{}:{}/{}", upstream.host, upstream.port, rest);
    let (backend, _response) = match connect_with_retry(&url).await {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(error = %err, url, "websocket upstream connect failed");
            close_with(&mut socket, 1011, "Upstream unavailable").await;
            return;
        }
    };

    relay(socket, backend, state, workspace_id).await;
}

/// Two independent relay directions; whichever side closes first tears down
/// the other, since `tokio::select!` drops the losing branch's future.
async fn relay(
    client: WebSocket,
    backend: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    state: AppState,
    workspace_id: WorkspaceId,
) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();
    let activity = state.activity.clone();

    let to_backend = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forward = match msg {
                Message::Text(text) => Some(UpstreamMessage::Text(text.to_string().into())),
                Message::Binary(bin) => Some(UpstreamMessage::Binary(bin.to_vec().into())),
                Message::Close(_) => None,
                _ => continue,
            };
            let Some(forward) = forward else { break };
            activity.record(workspace_id);
            if backend_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = backend_tx.close().await;
    };

    let to_client = async {
        while let Some(Ok(msg)) = backend_rx.next().await {
            let forward = match msg {
                UpstreamMessage::Text(text) => Some(Message::Text(text.to_string().into())),
                UpstreamMessage::Binary(bin) => Some(Message::Binary(bin.to_vec().into())),
                UpstreamMessage::Close(_) => None,
                _ => continue,
            };
            let Some(forward) = forward else { break };
            activity.record(workspace_id);
            if client_tx.send(forward).await.is_err() {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = to_backend => {}
        _ = to_client => {}
    }
}
