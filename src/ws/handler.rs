//! WebSocket upgrade handler and per-connection session
//!
//! The first binary frame must be a Join carrying the client's protocol
//! version. After that every frame is decoded and queued for the match; the
//! match answers with at most one buffer per tick on the outbound channel.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::{InboundMsg, PlayerInput};
use crate::util::rate_limit::ConnRateLimiter;
use crate::ws::protocol::{ClientMsg, DisconnectMsg, JoinMsg, ProtocolError};

/// Time a fresh connection has to send its Join
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_NAME: &str = "Player";

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Reasons a session ends
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("text frames are not part of the protocol")]
    TextFrame,

    #[error("first message was not a join")]
    NotJoined,

    #[error("join not received in time")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    Socket(#[from] axum::Error),
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_sink, mut ws_stream) = socket.split();

    let join = match timeout(JOIN_TIMEOUT, read_join(&mut ws_stream))
        .await
        .unwrap_or(Err(SessionError::Timeout))
    {
        Ok(join) => join,
        Err(e) => {
            warn!(conn_id = %conn_id, error = %e, "Handshake failed");
            let _ = ws_sink.send(Message::Close(None)).await;
            return;
        }
    };

    if let Err(e) = join.check_version() {
        warn!(conn_id = %conn_id, error = %e, "Rejecting client");
        if let Err(e) = send_disconnect(&mut ws_sink, "invalid_protocol").await {
            debug!(conn_id = %conn_id, error = %e, "Failed to send disconnect");
        }
        return;
    }

    let (handle, slot) = state.assign_match();
    let (outbound_tx, outbound_rx) = mpsc::channel(state.config.game.outbound_queue);
    let join_msg = PlayerInput {
        conn_id,
        msg: InboundMsg::Join {
            name: display_name(&join.name),
            outbound: outbound_tx,
            slot,
        },
    };
    if handle.input_tx.send(join_msg).await.is_err() {
        warn!(conn_id = %conn_id, match_id = %handle.id, "Match closed before join");
        let _ = send_disconnect(&mut ws_sink, "match_closed").await;
        return;
    }
    info!(conn_id = %conn_id, match_id = %handle.id, "Join forwarded to match");

    let limiter = ConnRateLimiter::new(state.config.input_rate_limit);
    run_session(conn_id, ws_sink, ws_stream, handle.input_tx, outbound_rx, limiter).await;

    info!(conn_id = %conn_id, "WebSocket connection closed");
}

/// Wait for the handshake; control frames are skipped
async fn read_join(stream: &mut WsStream) -> Result<JoinMsg, SessionError> {
    while let Some(frame) = stream.next().await {
        match decode_frame(frame?)? {
            Some(ClientMsg::Join(join)) => return Ok(join),
            Some(_) => return Err(SessionError::NotJoined),
            None => continue,
        }
    }
    Err(SessionError::Closed)
}

/// Run the WebSocket session with read/write split
async fn run_session(
    conn_id: Uuid,
    mut ws_sink: WsSink,
    mut ws_stream: WsStream,
    input_tx: mpsc::Sender<PlayerInput>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    limiter: ConnRateLimiter,
) {
    // Writer task: one buffer per tick -> WebSocket
    let mut writer = tokio::spawn(async move {
        while let Some(buffer) = outbound_rx.recv().await {
            if let Err(e) = ws_sink.send(Message::Binary(buffer.to_vec())).await {
                debug!(conn_id = %conn_id, error = %e, "WebSocket send failed");
                return;
            }
        }
        // The match dropped this connection or ended
        let _ = ws_sink.send(Message::Close(None)).await;
    });

    tokio::select! {
        result = read_loop(conn_id, &mut ws_stream, &input_tx, &limiter) => match result {
            Ok(()) | Err(SessionError::Closed) => debug!(conn_id = %conn_id, "Reader finished"),
            Err(e) => warn!(conn_id = %conn_id, error = %e, "Closing connection"),
        },
        _ = &mut writer => debug!(conn_id = %conn_id, "Outbound stream ended"),
    }

    // Signal disconnect to match loop
    let _ = input_tx
        .send(PlayerInput {
            conn_id,
            msg: InboundMsg::Leave,
        })
        .await;

    writer.abort();
}

/// Reader loop: WebSocket -> match loop
async fn read_loop(
    conn_id: Uuid,
    stream: &mut WsStream,
    input_tx: &mpsc::Sender<PlayerInput>,
    limiter: &ConnRateLimiter,
) -> Result<(), SessionError> {
    while let Some(frame) = stream.next().await {
        let Some(msg) = decode_frame(frame?)? else {
            continue;
        };

        if !limiter.check_input() {
            warn!(conn_id = %conn_id, "Rate limited inbound message");
            continue;
        }

        let input = PlayerInput {
            conn_id,
            msg: InboundMsg::Client(msg),
        };
        if input_tx.send(input).await.is_err() {
            debug!(conn_id = %conn_id, "Input channel closed");
            return Ok(());
        }
    }
    Err(SessionError::Closed)
}

/// Decode one inbound frame; control frames yield `None`
fn decode_frame(frame: Message) -> Result<Option<ClientMsg>, SessionError> {
    match frame {
        Message::Binary(data) => Ok(Some(ClientMsg::decode(&data)?)),
        Message::Text(_) => Err(SessionError::TextFrame),
        Message::Close(_) => Err(SessionError::Closed),
        Message::Ping(_) | Message::Pong(_) => Ok(None),
    }
}

async fn send_disconnect(sink: &mut WsSink, reason: &str) -> Result<(), SessionError> {
    let frame = DisconnectMsg {
        reason: reason.to_string(),
    }
    .to_frame()?;
    sink.send(Message::Binary(frame.to_vec())).await?;
    sink.send(Message::Close(None)).await?;
    Ok(())
}

/// Strip control characters; blank names get a default
fn display_name(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(|c| !c.is_control()).collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        DEFAULT_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}
