//! One viewer connection.
//!
//! The socket is split: a writer task drains the connection's outbox into the
//! sink, and the reader loop below handles subscription requests. Whichever
//! side finishes first ends the connection, and the registry entry is removed
//! in exactly one place on the way out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canvas::{Canvas, ConnectionId, OutboxReceiver, outbox};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tesserae_config::BroadcastConfig;
use tesserae_ipc::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::ServerError;

type Socket = WebSocketStream<TcpStream>;

/// Serve one viewer until it disconnects or stalls
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    canvas: Arc<Canvas>,
    config: BroadcastConfig,
) -> Result<(), ServerError> {
    let socket = tokio_tungstenite::accept_async(stream).await?;
    let (sink, mut source) = socket.split();

    let (tx, rx) = outbox(config.outbox_capacity);
    let id = canvas.connect(tx);
    info!("Viewer {} connected as {}", peer, id);

    let send_timeout = Duration::from_millis(config.send_timeout_ms);
    let mut writer = tokio::spawn(write_loop(sink, rx, send_timeout, id));

    let result = tokio::select! {
        result = read_loop(&mut source, &canvas, id) => result,
        _ = &mut writer => Ok(()),
    };

    canvas.disconnect(id);
    writer.abort();
    info!("Viewer {} ({}) disconnected", peer, id);
    result
}

async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut rx: OutboxReceiver,
    send_timeout: Duration,
    id: ConnectionId,
) {
    while let Some(frame) = rx.recv().await {
        match tokio::time::timeout(send_timeout, sink.send(Message::text(frame.to_string()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Send to {} failed: {}", id, e);
                return;
            }
            Err(_) => {
                warn!("Send to {} stalled for {:?}, closing", id, send_timeout);
                return;
            }
        }
    }
}

async fn read_loop(
    source: &mut SplitStream<Socket>,
    canvas: &Canvas,
    id: ConnectionId,
) -> Result<(), ServerError> {
    while let Some(message) = source.next().await {
        match message? {
            Message::Text(text) => handle_text(canvas, id, text.as_str()),
            Message::Binary(_) => debug!("Ignoring binary frame from {}", id),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

fn handle_text(canvas: &Canvas, id: ConnectionId, text: &str) {
    let request = match ClientMessage::from_json(text) {
        Ok(request) => request,
        Err(e) => {
            warn!("Ignoring message from {}: {}", id, e);
            return;
        }
    };

    let (verb, change) = match &request {
        ClientMessage::Subscribe { chunks } => {
            ("subscribed to", canvas.subscribe(id, chunks.as_slice()))
        }
        ClientMessage::Unsubscribe { chunks } => {
            ("unsubscribed from", canvas.unsubscribe(id, chunks.as_slice()))
        }
    };
    debug!(
        "{} {} {} chunks ({} rejected)",
        id,
        verb,
        change.accepted.len(),
        change.rejected.len()
    );

    if !change.rejected.is_empty() {
        let reply = ServerMessage::Error {
            code: "invalid_chunk_ids".into(),
            message: format!("Ignored invalid chunk ids: {}", change.rejected.join(", ")),
        };
        canvas.broadcaster().send_to(id, &reply);
    }
}
