//! One WebSocket connection: a writer task, a ping loop and the read loop.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::message::{Inbound, Response};
use super::peer::{Peer, Peers};
use super::registry::Registry;
use crate::error::RpcError;

/// Serve `stream` until the client leaves or stops answering pings.
pub async fn serve_connection<S: Send + Sync + 'static>(
    registry: Arc<Registry<S>>,
    peers: Peers,
    stream: TcpStream,
    heartbeat: Duration,
    id: u64,
) -> Result<(), RpcError> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let peer = Peer::new(id, tx);
    let clients = peers.insert(peer.clone());
    info!(peer = id, clients, "client connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!(peer = id, error = %e, "write failed");
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let pinger = {
        let peer = peer.clone();
        tokio::spawn(async move {
            let mut ticker = time::interval(heartbeat / 2);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if peer.send(WsMessage::Ping(Vec::new())).is_err() {
                    break;
                }
            }
        })
    };

    let result = read_loop(&registry, &peer, &mut source, heartbeat).await;

    pinger.abort();
    let _ = peer.send(WsMessage::Close(None));
    peer.abandon_pending();
    let clients = peers.remove(id);
    drop(peer);
    let _ = writer.await;

    match &result {
        Ok(()) => info!(peer = id, clients, "client disconnected"),
        Err(e) => warn!(peer = id, clients, error = %e, "client connection ended"),
    }
    result
}

async fn read_loop<S, R>(
    registry: &Arc<Registry<S>>,
    peer: &Peer,
    source: &mut R,
    heartbeat: Duration,
) -> Result<(), RpcError>
where
    S: Send + Sync + 'static,
    R: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let next = time::timeout(heartbeat, source.next())
            .await
            .map_err(|_| RpcError::HeartbeatTimeout)?;

        let message = match next {
            Some(message) => message?,
            None => return Ok(()),
        };

        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(peer = peer.id(), "ignoring non-UTF-8 binary message");
                    continue;
                }
            },
            WsMessage::Pong(_) => {
                debug!(peer = peer.id(), "pong");
                continue;
            }
            WsMessage::Close(_) => return Ok(()),
            _ => continue,
        };

        match Inbound::parse(&text) {
            Ok(Inbound::Call(call)) => {
                let registry = Arc::clone(registry);
                let peer = peer.clone();
                tokio::spawn(async move {
                    let response = registry.dispatch(peer.clone(), call).await;
                    if let Err(e) = peer.respond(&response) {
                        debug!(peer = peer.id(), error = %e, "could not send response");
                    }
                });
            }
            Ok(Inbound::Response(response)) => peer.complete(response),
            Ok(Inbound::Malformed { request_id, error }) => {
                debug!(peer = peer.id(), %request_id, error = %error, "rejecting malformed call");
                if let Err(e) = peer.respond(&Response::from_result(request_id, Err(error))) {
                    debug!(peer = peer.id(), error = %e, "could not send response");
                }
            }
            Err(e) => warn!(peer = peer.id(), error = %e, "ignoring malformed message"),
        }
    }
}
