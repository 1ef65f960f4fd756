//! The agent: owns the live-flow cache, packet history and running traces,
//! and implements every operation exposed to clients.

use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tokio::time;
use tracing::{debug, info, warn};

use crate::cache::ConnectionCache;
use crate::config::{AgentConfig, CaptureMode, Settings};
use crate::database;
use crate::devices;
use crate::elevation::{self, AfterEscalation, EscalationPlan, Platform};
use crate::error::{CaptureError, DatabaseError, EscalationError, RpcError, TraceError};
use crate::geo::{GeoDatabase, Resolve};
use crate::history::PacketHistory;
use crate::models::{DecodedFrame, Device, TracedConnection};
use crate::relaunch;
use crate::rpc::{Peer, Peers};
use crate::sniff::{self, FrameStream, Opened};

/// Method the agent calls on a client to ask for escalation consent.
pub const GET_ESCALATION_PERMISSION: &str = "GetEscalationPermission";

/// Where capture handles, geolocation lookups and elevation come from.
pub trait Backend: Send + Sync {
    fn open_resolver(&self, path: &Path) -> Result<Box<dyn Resolve>, DatabaseError>;

    fn open_capture<'a>(&'a self, device: &'a Device) -> BoxFuture<'a, Result<Opened, TraceError>>;

    fn escalate<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<(), EscalationError>>;
}

/// Real pcap, real MaxMind database, real elevation prompts.
pub struct SystemBackend {
    mode: CaptureMode,
    executable: PathBuf,
}

impl SystemBackend {
    pub fn new(mode: CaptureMode, executable: PathBuf) -> Self {
        Self { mode, executable }
    }
}

impl Backend for SystemBackend {
    fn open_resolver(&self, path: &Path) -> Result<Box<dyn Resolve>, DatabaseError> {
        Ok(Box::new(GeoDatabase::open(path)?))
    }

    fn open_capture<'a>(&'a self, device: &'a Device) -> BoxFuture<'a, Result<Opened, TraceError>> {
        async move {
            match self.mode {
                CaptureMode::Direct => Ok(sniff::open_direct(device)?),
                CaptureMode::Relay => sniff::open_relay(&self.executable, device).await,
            }
        }
        .boxed()
    }

    fn escalate<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<(), EscalationError>> {
        elevation::run_elevated(command).boxed()
    }
}

/// A device is `Starting` while consent and escalation are pending, and
/// `Running` once frames flow.
enum Trace {
    Starting,
    Running { id: u64, stop: oneshot::Sender<()> },
}

/// Steps of a trace request. Only `ProbeDirect` can finish successfully.
enum Step {
    ProbeDirect,
    RequestConsent,
    Escalate(EscalationPlan),
}

pub struct Agent {
    config: AgentConfig,
    settings: RwLock<Settings>,
    cache: ConnectionCache,
    history: PacketHistory,
    tracing: Mutex<HashMap<String, Trace>>,
    trace_ids: AtomicU64,
    peers: Peers,
    backend: Box<dyn Backend>,
    platform: Platform,
    executable: PathBuf,
    args: Vec<OsString>,
}

impl Agent {
    pub fn new(config: AgentConfig, settings: Settings, peers: Peers) -> Self {
        let backend = SystemBackend::new(config.capture_mode, current_executable());
        Self::with_backend(config, settings, peers, Box::new(backend), Platform::current())
    }

    pub fn with_backend(
        config: AgentConfig,
        settings: Settings,
        peers: Peers,
        backend: Box<dyn Backend>,
        platform: Platform,
    ) -> Self {
        Self {
            cache: ConnectionCache::new(config.idle_timeout, settings.max_connections_cache),
            history: PacketHistory::new(settings.max_packet_cache),
            settings: RwLock::new(settings),
            config,
            tracing: Mutex::new(HashMap::new()),
            trace_ids: AtomicU64::new(0),
            peers,
            backend,
            platform,
            executable: current_executable(),
            args: env::args_os().skip(1).collect(),
        }
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, CaptureError> {
        tokio::task::spawn_blocking(devices::list_devices)
            .await
            .map_err(|e| CaptureError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    /// Start capturing on `device`. Tracing a device twice is a no-op.
    ///
    /// When capture is refused the caller (or, failing that, any attached
    /// client) is asked for consent before privileges are escalated; this can
    /// end with the whole process being replaced.
    pub async fn trace_device(self: &Arc<Self>, caller: Option<&Peer>, device: Device) -> Result<(), TraceError> {
        let name = device.capture_name.clone();
        {
            let mut tracing = self.tracing.lock().await;
            if tracing.contains_key(&name) {
                debug!(device = %name, "already tracing");
                return Ok(());
            }
            tracing.insert(name.clone(), Trace::Starting);
        }

        let started = self.start(caller, &device).await;

        let mut tracing = self.tracing.lock().await;
        let (frames, resolver) = match started {
            Ok(opened) => opened,
            Err(e) => {
                if matches!(tracing.get(&name), Some(Trace::Starting)) {
                    tracing.remove(&name);
                }
                return Err(e);
            }
        };
        if !matches!(tracing.get(&name), Some(Trace::Starting)) {
            debug!(device = %name, "stopped while starting");
            return Ok(());
        }

        let id = self.trace_ids.fetch_add(1, Ordering::Relaxed);
        let (stop, stopped) = oneshot::channel();
        tracing.insert(name.clone(), Trace::Running { id, stop });
        info!(device = %name, mtu = device.mtu, "tracing device");

        tokio::spawn(Arc::clone(self).run_trace(name, id, frames, resolver, stopped));
        Ok(())
    }

    async fn start(
        &self,
        caller: Option<&Peer>,
        device: &Device,
    ) -> Result<(FrameStream, Box<dyn Resolve>), TraceError> {
        let db_path = self.read_settings().db_path.clone();
        let resolver = self.backend.open_resolver(&db_path)?;
        let frames = self.acquire(caller, device).await?;
        Ok((frames, resolver))
    }

    /// Also cancels a trace that is still waiting on consent or escalation.
    pub async fn stop_trace_device(&self, device: &Device) -> bool {
        match self.tracing.lock().await.remove(&device.capture_name) {
            Some(trace) => {
                if let Trace::Running { stop, .. } = trace {
                    let _ = stop.send(());
                }
                info!(device = %device.capture_name, "stopped tracing device");
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let traces: Vec<_> = self.tracing.lock().await.drain().collect();
        for (name, trace) in traces {
            if let Trace::Running { stop, .. } = trace {
                let _ = stop.send(());
            }
            debug!(device = %name, "stopped tracing device");
        }
    }

    async fn acquire(&self, caller: Option<&Peer>, device: &Device) -> Result<FrameStream, TraceError> {
        let mut escalations = 0;
        let mut step = Step::ProbeDirect;

        loop {
            step = match step {
                Step::ProbeDirect => match self.backend.open_capture(device).await? {
                    Opened::Capturing(frames) => return Ok(frames),
                    Opened::PermissionDenied if escalations >= self.config.max_escalations => {
                        return Err(TraceError::StillDenied(escalations));
                    }
                    Opened::PermissionDenied => Step::RequestConsent,
                },
                Step::RequestConsent => {
                    let plan = self.escalation_plan();
                    let restart = plan.then != AfterEscalation::Reprobe;
                    match self.ask_consent(caller, restart).await {
                        Ok(true) => Step::Escalate(plan),
                        Ok(false) => return Err(TraceError::ConsentDenied),
                        Err(e) => return Err(TraceError::ConsentUnanswered(e)),
                    }
                }
                Step::Escalate(plan) => {
                    escalations += 1;
                    info!(device = %device.capture_name, attempt = escalations, "escalating privileges");
                    self.backend.escalate(&plan.command).await?;
                    match plan.then {
                        AfterEscalation::Reprobe => Step::ProbeDirect,
                        AfterEscalation::Relaunch => {
                            relaunch::relaunch()?;
                            relaunch::exit_for_restart(self.config.companion_pid)
                        }
                        AfterEscalation::Exit => relaunch::exit_for_restart(self.config.companion_pid),
                    }
                }
            };
        }
    }

    fn escalation_plan(&self) -> EscalationPlan {
        elevation::plan(self.platform, self.config.capture_mode, &self.executable, &self.args)
    }

    /// `Ok(true)` when no client is attached: the OS prompt is the consent.
    async fn ask_consent(&self, caller: Option<&Peer>, restart: bool) -> Result<bool, RpcError> {
        let Some(peer) = caller.cloned().or_else(|| self.peers.list().into_iter().next()) else {
            info!("no client attached, escalating without asking");
            return Ok(true);
        };

        debug!(peer = peer.id(), restart, "asking for escalation consent");
        let ask = peer.call::<bool>(GET_ESCALATION_PERMISSION, vec![json!(restart)]);
        match self.config.consent_timeout {
            Some(limit) => time::timeout(limit, ask).await.map_err(|_| RpcError::Timeout)?,
            None => ask.await,
        }
    }

    async fn run_trace(
        self: Arc<Self>,
        name: String,
        id: u64,
        mut frames: FrameStream,
        resolver: Box<dyn Resolve>,
        mut stopped: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                frame = frames.recv() => match frame {
                    Some(frame) => self.ingest(resolver.as_ref(), frame),
                    None => {
                        info!(device = %name, "capture stream ended");
                        break;
                    }
                },
            }
        }
        drop(frames);
        drop(resolver);

        let mut tracing = self.tracing.lock().await;
        if matches!(tracing.get(&name), Some(Trace::Running { id: running, .. }) if *running == id) {
            tracing.remove(&name);
        }
    }

    fn ingest(&self, resolver: &dyn Resolve, frame: DecodedFrame) {
        let src_geo = resolver.resolve(frame.src_ip);
        let dst_geo = resolver.resolve(frame.dst_ip);
        let connection = TracedConnection::new(frame, Utc::now().timestamp_millis(), src_geo, dst_geo);

        self.history.record(connection.clone());
        self.cache.observe(connection);
    }

    pub fn connections(&self) -> Vec<TracedConnection> {
        self.cache.connections()
    }

    pub fn packets(&self) -> Vec<TracedConnection> {
        self.history.packets()
    }

    pub fn set_summarized(&self, summarized: bool) {
        self.history.set_summarized(summarized);
    }

    pub fn is_summarized(&self) -> bool {
        self.history.is_summarized()
    }

    /// True when the database is missing and has to be downloaded first.
    pub fn check_database(&self) -> bool {
        database::needs_download(&self.read_settings().db_path)
    }

    pub async fn download_database(&self, license_key: &str) -> Result<(), DatabaseError> {
        let (url, path) = {
            let settings = self.read_settings();
            (settings.db_download_url.clone(), settings.db_path.clone())
        };
        database::download(&url, license_key, &path).await
    }

    pub fn db_path(&self) -> PathBuf {
        self.read_settings().db_path.clone()
    }

    pub fn set_db_path(&self, path: PathBuf) {
        self.write_settings().db_path = path;
    }

    pub fn db_download_url(&self) -> String {
        self.read_settings().db_download_url.clone()
    }

    pub fn set_db_download_url(&self, url: String) {
        self.write_settings().db_download_url = url;
    }

    pub fn max_packet_cache(&self) -> usize {
        self.history.capacity()
    }

    pub fn set_max_packet_cache(&self, max: usize) {
        self.history.set_capacity(max);
        self.write_settings().max_packet_cache = max;
    }

    pub fn max_connections_cache(&self) -> usize {
        self.cache.max_connections()
    }

    pub fn set_max_connections_cache(&self, max: usize) {
        self.cache.set_max_connections(max);
        self.write_settings().max_connections_cache = max;
    }

    /// Restart the agent, optionally fixing capture permissions first.
    /// Declining the consent prompt cancels the restart without error.
    pub async fn restart_app(&self, caller: Option<&Peer>, fix_permissions: bool) -> Result<(), TraceError> {
        let mut then = AfterEscalation::Relaunch;

        if fix_permissions {
            match self.ask_consent(caller, true).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("restart declined");
                    return Ok(());
                }
                Err(e) => return Err(TraceError::ConsentUnanswered(e)),
            }

            let plan = self.escalation_plan();
            self.backend.escalate(&plan.command).await?;
            then = plan.then;
        }

        if then != AfterEscalation::Exit {
            relaunch::relaunch()?;
        }
        relaunch::exit_for_restart(self.config.companion_pid)
    }

    pub async fn open_external_link(&self, url: String) -> io::Result<()> {
        debug!(%url, "opening external link");
        tokio::task::spawn_blocking(move || open::that(url))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    fn read_settings(&self) -> RwLockReadGuard<'_, Settings> {
        self.settings.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_settings(&self) -> RwLockWriteGuard<'_, Settings> {
        self.settings.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn current_executable() -> PathBuf {
    env::current_exe().unwrap_or_else(|e| {
        warn!(error = %e, "could not resolve executable path");
        env::args_os().next().map(PathBuf::from).unwrap_or_default()
    })
}
