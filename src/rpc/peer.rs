use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use super::message::{Call, Response};
use crate::error::RpcError;

type Pending = Mutex<HashMap<String, oneshot::Sender<Response>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drops the waiter for `request_id` when the call goes away, answered or not.
struct PendingEntry<'a> {
    pending: &'a Pending,
    request_id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.request_id);
    }
}

/// Handle to one attached client. Cloning is cheap; every clone talks over the
/// same connection.
#[derive(Clone)]
pub struct Peer {
    id: u64,
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: Arc<Pending>,
    next_request: Arc<AtomicU64>,
}

impl Peer {
    pub(crate) fn new(id: u64, outbound: mpsc::UnboundedSender<WsMessage>) -> Self {
        Self {
            id,
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Call `name` on the client and wait for its answer.
    pub async fn call<R: DeserializeOwned>(&self, name: &str, args: Vec<Value>) -> Result<R, RpcError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(request_id.clone(), tx);
        let _entry = PendingEntry {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        let envelope = Call {
            request_id: request_id.clone(),
            name: name.to_string(),
            args,
        };
        let text = serde_json::to_string(&envelope)?;
        self.send(WsMessage::Text(text))?;
        debug!(peer = self.id, %request_id, name, "calling client");

        let response = rx.await.map_err(|_| RpcError::ConnectionClosed)?;
        if !response.error.is_empty() {
            return Err(RpcError::Remote(response.error));
        }

        Ok(serde_json::from_value(response.value)?)
    }

    /// Hand a response to the call waiting for it.
    pub(crate) fn complete(&self, response: Response) {
        let waiter = self.lock_pending().remove(&response.request_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(response);
            }
            None => warn!(peer = self.id, request_id = %response.request_id, "response for unknown request"),
        }
    }

    pub(crate) fn respond(&self, response: &Response) -> Result<(), RpcError> {
        let text = serde_json::to_string(response)?;
        self.send(WsMessage::Text(text))
    }

    pub(crate) fn send(&self, message: WsMessage) -> Result<(), RpcError> {
        self.outbound
            .send(message)
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Fail every outstanding call; used when the connection goes away.
    pub(crate) fn abandon_pending(&self) {
        self.lock_pending().clear();
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
        lock(&self.pending)
    }
}

/// Clients currently attached to the server.
#[derive(Clone, Default)]
pub struct Peers {
    inner: Arc<RwLock<BTreeMap<u64, Peer>>>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, peer: Peer) -> usize {
        let mut peers = self.inner.write().unwrap_or_else(|p| p.into_inner());
        peers.insert(peer.id(), peer);
        peers.len()
    }

    pub(crate) fn remove(&self, id: u64) -> usize {
        let mut peers = self.inner.write().unwrap_or_else(|p| p.into_inner());
        peers.remove(&id);
        peers.len()
    }

    /// Snapshot of attached clients, oldest connection first.
    pub fn list(&self) -> Vec<Peer> {
        self.inner
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
