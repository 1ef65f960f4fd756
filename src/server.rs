//! WebSocket RPC server exposing the agent to visualization clients.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::agent::Agent;
use crate::error::{BindError, RpcError};
use crate::models::Device;
use crate::rpc::{self, Registry};

/// Every method clients may call on the agent.
pub fn local_registry(agent: Arc<Agent>) -> Result<Registry<Agent>, BindError> {
    let mut registry = Registry::new(agent);

    registry.bind0("ListDevices", |agent: Arc<Agent>, _| async move { agent.list_devices().await })?;
    registry.bind1("TraceDevice", |agent: Arc<Agent>, peer, device: Device| async move {
        agent.trace_device(Some(&peer), device).await
    })?;
    registry.bind1("StopTraceDevice", |agent: Arc<Agent>, _, device: Device| async move {
        Ok::<_, RpcError>(agent.stop_trace_device(&device).await)
    })?;

    registry.bind0("GetConnections", |agent: Arc<Agent>, _| async move {
        Ok::<_, RpcError>(agent.connections())
    })?;
    registry.bind0("GetPackets", |agent: Arc<Agent>, _| async move {
        Ok::<_, RpcError>(agent.packets())
    })?;
    registry.bind1("SetIsSummarized", |agent: Arc<Agent>, _, summarized: bool| async move {
        agent.set_summarized(summarized);
        Ok::<_, RpcError>(())
    })?;
    registry.bind0("GetIsSummarized", |agent: Arc<Agent>, _| async move {
        Ok::<_, RpcError>(agent.is_summarized())
    })?;

    registry.bind0("CheckDatabase", |agent: Arc<Agent>, _| async move {
        Ok::<_, RpcError>(agent.check_database())
    })?;
    registry.bind1("DownloadDatabase", |agent: Arc<Agent>, _, license_key: String| async move {
        agent.download_database(&license_key).await
    })?;
    registry.bind1("SetDBPath", |agent: Arc<Agent>, _, path: PathBuf| async move {
        agent.set_db_path(path);
        Ok::<_, RpcError>(())
    })?;
    registry.bind0("GetDBPath", |agent: Arc<Agent>, _| async move {
        Ok::<_, RpcError>(agent.db_path())
    })?;
    registry.bind1("SetDBDownloadURL", |agent: Arc<Agent>, _, url: String| async move {
        agent.set_db_download_url(url);
        Ok::<_, RpcError>(())
    })?;
    registry.bind0("GetDBDownloadURL", |agent: Arc<Agent>, _| async move {
        Ok::<_, RpcError>(agent.db_download_url())
    })?;

    registry.bind1("SetMaxPacketCache", |agent: Arc<Agent>, _, max: usize| async move {
        agent.set_max_packet_cache(max);
        Ok::<_, RpcError>(())
    })?;
    registry.bind0("GetMaxPacketCache", |agent: Arc<Agent>, _| async move {
        Ok::<_, RpcError>(agent.max_packet_cache())
    })?;
    registry.bind1("SetMaxConnectionsCache", |agent: Arc<Agent>, _, max: usize| async move {
        agent.set_max_connections_cache(max);
        Ok::<_, RpcError>(())
    })?;
    registry.bind0("GetMaxConnectionsCache", |agent: Arc<Agent>, _| async move {
        Ok::<_, RpcError>(agent.max_connections_cache())
    })?;

    registry.bind1("RestartApp", |agent: Arc<Agent>, peer, fix_permissions: bool| async move {
        agent.restart_app(Some(&peer), fix_permissions).await
    })?;
    registry.bind1("OpenExternalLink", |agent: Arc<Agent>, _, url: String| async move {
        agent.open_external_link(url).await
    })?;

    Ok(registry)
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry<Agent>>,
    heartbeat: Duration,
}

impl Server {
    /// Failing to bind is the one error the agent cannot recover from.
    pub async fn bind(addr: &str, registry: Registry<Agent>, heartbeat: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry: Arc::new(registry),
            heartbeat,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn url(&self) -> io::Result<String> {
        Ok(format!("ws://{}", self.local_addr()?))
    }

    /// Accept clients until `shutdown` resolves.
    pub async fn serve<F: Future<Output = ()>>(self, shutdown: F) {
        let next_id = AtomicU64::new(0);
        let peers = self.registry.service().peers().clone();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down server");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        debug!(peer = id, %remote, "accepted connection");
                        let registry = Arc::clone(&self.registry);
                        let peers = peers.clone();
                        let heartbeat = self.heartbeat;
                        tokio::spawn(async move {
                            if let Err(e) = rpc::serve_connection(registry, peers, stream, heartbeat, id).await {
                                debug!(peer = id, error = %e, "session ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "failed to accept connection"),
                },
            }
        }
    }
}
