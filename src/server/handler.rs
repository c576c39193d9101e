use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    auth::tokens_match,
    server::{
        message::{parse_client_message, ClientMessage, ConfigRequest, ErrorCode, MessageError, ServerMessage},
        middleware::validation::{tail_lines, validate_frame, validate_message},
        AppState, Client,
    },
};

/// Bound on every direct reply to a client.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// `GET /ws`: upgrades to the dashboard protocol.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let addr = peer.map(|ConnectInfo(addr)| addr);
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// Handles one WebSocket connection until it closes or the server shuts down.
///
/// The client is registered and sent its snapshot while its write half is
/// locked, so no broadcast can reach it before the snapshot.
#[instrument(skip(socket, state))]
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: Option<SocketAddr>) {
    let (writer, mut reader) = socket.split();
    let client = Client::new(addr, writer);

    let greeted = {
        let mut sink = client.lock_sink().await;
        state.broadcaster.add_client(client.clone());
        state.metrics.connections.inc();

        let snapshot = ServerMessage::ambiente(&state.config.get(), state.build.version());
        match Message::try_from(&snapshot) {
            Ok(frame) => matches!(tokio::time::timeout(REPLY_TIMEOUT, sink.send(frame)).await, Ok(Ok(()))),
            Err(e) => {
                error!("Failed to encode snapshot: {}", e);
                false
            }
        }
    };
    info!("Client connected: {} ({:?})", client.id, addr);

    if greeted {
        state.metrics.messages_sent.inc();
        listen(&mut reader, &client, &state).await;
    } else {
        warn!("Could not send snapshot to client {}", client.id);
    }

    if state.broadcaster.remove_client(&client.id) {
        client.close(REPLY_TIMEOUT).await;
    }
    state.metrics.connections.dec();
    state.config_limiter.forget(&client.id.to_string());
    info!("Client disconnected: {}", client.id);
}

async fn listen<R>(reader: &mut R, client: &Client, state: &AppState)
where
    R: futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    info!("Listening for client messages: {}", client.id);
    loop {
        let frame = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            frame = reader.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                state.metrics.messages_received.inc();
                dispatch(&text, client, state).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => debug!("Unhandled message type"),
            Some(Err(e)) => {
                debug!("Read error from client {}: {}", client.id, e);
                break;
            }
        }
    }
    info!("Stopped listening for client messages: {}", client.id);
}

fn decode(text: &str) -> Result<ClientMessage, MessageError> {
    validate_frame(text)?;
    let msg = parse_client_message(text)?;
    validate_message(&msg)?;
    Ok(msg)
}

/// Routes one inbound frame by its `tipo`. Malformed or unknown frames are ignored.
async fn dispatch(text: &str, client: &Client, state: &AppState) {
    let msg = match decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("Ignoring message from {}: {}", client.id, e);
            return;
        }
    };

    match msg {
        ClientMessage::Config(req) => handle_config(req, client, state).await,
        ClientMessage::LogConfig { verbose } => {
            state.logs.set_verbose(verbose);
            reply(client, &ServerMessage::from(state.logs.status())).await;
        }
        ClientMessage::LogFlush {} => {
            let logs = Arc::clone(&state.logs);
            let result = match tokio::task::spawn_blocking(move || logs.flush()).await {
                Ok(Ok(())) => ServerMessage::LogFlushResult { ok: true, error: None },
                Ok(Err(e)) => ServerMessage::LogFlushResult { ok: false, error: Some(e.to_string()) },
                Err(e) => ServerMessage::LogFlushResult { ok: false, error: Some(e.to_string()) },
            };
            reply(client, &result).await;
        }
        ClientMessage::LogTail { lines } => {
            let n = tail_lines(lines);
            let logs = Arc::clone(&state.logs);
            let lines = tokio::task::spawn_blocking(move || logs.tail(n))
                .await
                .unwrap_or_default();
            reply(client, &ServerMessage::LogLines { lines }).await;
        }
        ClientMessage::LogStatus {} => {
            reply(client, &ServerMessage::from(state.logs.status())).await;
        }
    }
}

async fn handle_config(req: ConfigRequest, client: &Client, state: &AppState) {
    if !state.config_limiter.allow(&client.id.to_string()) {
        warn!("AUDIT CONFIG_RATE_LIMITED client={}", client.id);
        reply(client, &ServerMessage::Error { error: ErrorCode::RateLimited }).await;
        return;
    }

    if let Some(expected) = state.build.auth_token.as_deref() {
        let provided = req.auth_token.as_deref().unwrap_or_default();
        if !tokens_match(expected, provided) {
            warn!("AUDIT CONFIG_REJECTED client={} reason=invalid_token", client.id);
            reply(client, &ServerMessage::Error { error: ErrorCode::AuthInvalidToken }).await;
            return;
        }
    }

    if state.config.update(&req.puerto, &req.marca, req.modo_prueba) {
        let snapshot = state.config.get();
        info!(
            "AUDIT CONFIG_ACCEPTED client={} port={} brand={} test_mode={}",
            client.id, snapshot.port, snapshot.brand, snapshot.test_mode
        );
        (state.on_config_change)();
    } else {
        info!("Configuration unchanged");
    }
}

async fn reply(client: &Client, msg: &ServerMessage) {
    let frame = match Message::try_from(msg) {
        Ok(frame) => frame,
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            return;
        }
    };
    if let Err(e) = client.send(frame, REPLY_TIMEOUT).await {
        debug!("Reply to client {} failed: {}", client.id, e);
    }
}
