//! Network listener with DNS-SD advertisement and self-healing rebinds.
//!
//! The [`DiscoveryManager`] binds a TCP listener, advertises it on the local
//! network and hands every accepted stream to a callback. A supervisor task
//! polls the listener state; a failed listener, or one that could not bind
//! because the port is taken, is replaced by a listener on a fresh ephemeral
//! port and re-advertised. Peers that discover the service follow the move.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How often the supervisor checks listener health.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Pause before rebinding after an address-in-use failure.
pub const ADDRESS_IN_USE_RETRY_DELAY: Duration = Duration::from_secs(2);

pub const DEFAULT_SERVICE_TYPE: &str = "_mcp._tcp.local.";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery is already running")]
    AlreadyRunning,

    #[error("Service advertisement failed: {0}")]
    Advertise(String),
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub bind_addr: IpAddr,
    /// Initial port; 0 picks an ephemeral one.
    pub port: u16,
    pub service_type: String,
    pub instance_name: String,
    pub health_interval: Duration,
    pub retry_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            instance_name: env!("CARGO_PKG_NAME").to_string(),
            health_interval: HEALTH_CHECK_INTERVAL,
            retry_delay: ADDRESS_IN_USE_RETRY_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitReason {
    AddressInUse,
    Other(String),
}

/// Health of the advertised listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Starting,
    Ready { port: u16 },
    Waiting(WaitReason),
    Failed(String),
    Cancelled,
}

impl std::fmt::Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready { port } => write!(f, "ready on port {}", port),
            Self::Waiting(WaitReason::AddressInUse) => write!(f, "waiting (address in use)"),
            Self::Waiting(WaitReason::Other(reason)) => write!(f, "waiting ({})", reason),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub type StateCallback = Arc<dyn Fn(ListenerState) + Send + Sync>;
pub type ConnectionCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// Publishes the listener's port on the local network.
pub trait ServiceAdvertiser: Send + Sync {
    fn advertise(&self, port: u16) -> Result<(), DiscoveryError>;
    fn withdraw(&self);
}

/// Advertiser used when advertisement is switched off.
#[derive(Debug, Default)]
pub struct NoopAdvertiser;

impl ServiceAdvertiser for NoopAdvertiser {
    fn advertise(&self, port: u16) -> Result<(), DiscoveryError> {
        tracing::debug!("Advertisement disabled, listening on port {}", port);
        Ok(())
    }

    fn withdraw(&self) {}
}

/// Multicast DNS-SD advertiser.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    service_type: String,
    instance_name: String,
    host_name: String,
    registered: Mutex<Option<String>>,
}

impl MdnsAdvertiser {
    pub fn new(service_type: &str, instance_name: &str) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|e| DiscoveryError::Advertise(e.to_string()))?;
        let host: String = instance_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        Ok(Self {
            daemon,
            service_type: service_type.to_string(),
            instance_name: instance_name.to_string(),
            host_name: format!("{}.local.", host.trim_matches('-')),
            registered: Mutex::new(None),
        })
    }

    fn registered(&self) -> MutexGuard<'_, Option<String>> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ServiceAdvertiser for MdnsAdvertiser {
    fn advertise(&self, port: u16) -> Result<(), DiscoveryError> {
        self.withdraw();

        let properties = [("version", env!("CARGO_PKG_VERSION"))];
        let info = ServiceInfo::new(
            &self.service_type,
            &self.instance_name,
            &self.host_name,
            "",
            port,
            &properties[..],
        )
        .map_err(|e| DiscoveryError::Advertise(e.to_string()))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| DiscoveryError::Advertise(e.to_string()))?;
        tracing::info!("Advertising {} on port {}", fullname, port);
        *self.registered() = Some(fullname);
        Ok(())
    }

    fn withdraw(&self) {
        if let Some(fullname) = self.registered().take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                tracing::warn!("Failed to withdraw advertisement {}: {}", fullname, e);
            }
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.withdraw();
        let _ = self.daemon.shutdown();
    }
}

#[derive(Clone)]
struct Callbacks {
    on_state_change: StateCallback,
    on_new_connection: ConnectionCallback,
}

struct Inner {
    callbacks: Option<Callbacks>,
    /// Bumped for every new listener; stale listeners cannot publish state.
    generation: u64,
    state: ListenerState,
    port: Option<u16>,
    listener_cancel: Option<CancellationToken>,
    supervisor_cancel: Option<CancellationToken>,
}

struct Shared {
    config: DiscoveryConfig,
    advertiser: Arc<dyn ServiceAdvertiser>,
    inner: Mutex<Inner>,
    /// Wakes the supervisor as soon as a bind hits address-in-use.
    wake: Notify,
}

/// Owns the listener and its advertisement. Cheap to clone.
#[derive(Clone)]
pub struct DiscoveryManager {
    shared: Arc<Shared>,
}

impl DiscoveryManager {
    pub fn new(config: DiscoveryConfig, advertiser: Arc<dyn ServiceAdvertiser>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                advertiser,
                inner: Mutex::new(Inner {
                    callbacks: None,
                    generation: 0,
                    state: ListenerState::Cancelled,
                    port: None,
                    listener_cancel: None,
                    supervisor_cancel: None,
                }),
                wake: Notify::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ListenerState {
        self.inner().state.clone()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.inner().port
    }

    pub fn is_running(&self) -> bool {
        self.inner().supervisor_cancel.is_some()
    }

    /// Bind, advertise and start supervising the listener.
    pub async fn start(
        &self,
        on_state_change: StateCallback,
        on_new_connection: ConnectionCallback,
    ) -> Result<(), DiscoveryError> {
        let supervisor = CancellationToken::new();
        {
            let mut inner = self.inner();
            if inner.supervisor_cancel.is_some() {
                return Err(DiscoveryError::AlreadyRunning);
            }
            inner.callbacks = Some(Callbacks {
                on_state_change,
                on_new_connection,
            });
            inner.supervisor_cancel = Some(supervisor.clone());
        }

        tracing::info!(
            service_type = %self.shared.config.service_type,
            instance = %self.shared.config.instance_name,
            "Starting discovery"
        );
        self.bind(self.shared.config.port).await;

        let manager = self.clone();
        tokio::spawn(async move { manager.supervise(supervisor).await });
        Ok(())
    }

    /// Cancel the listener, the supervisor and the advertisement. Idempotent.
    pub fn stop(&self) {
        let (callbacks, listener, supervisor) = {
            let mut inner = self.inner();
            if inner.supervisor_cancel.is_none() && inner.listener_cancel.is_none() {
                return;
            }
            inner.generation = inner.generation.wrapping_add(1);
            inner.state = ListenerState::Cancelled;
            inner.port = None;
            (
                inner.callbacks.take(),
                inner.listener_cancel.take(),
                inner.supervisor_cancel.take(),
            )
        };

        if let Some(supervisor) = supervisor {
            supervisor.cancel();
        }
        if let Some(listener) = listener {
            listener.cancel();
        }
        self.shared.advertiser.withdraw();
        tracing::info!("Discovery stopped");

        if let Some(callbacks) = callbacks {
            (callbacks.on_state_change)(ListenerState::Cancelled);
        }
    }

    /// Replace the listener with one on a fresh ephemeral port.
    pub async fn restart_with_new_port(&self) {
        if !self.is_running() {
            return;
        }
        tracing::info!("Restarting listener on a new port");
        self.shared.advertiser.withdraw();
        self.bind(0).await;
    }

    fn set_state(&self, generation: u64, state: ListenerState) {
        let callbacks = {
            let mut inner = self.inner();
            if inner.generation != generation {
                return;
            }
            inner.state = state.clone();
            inner.callbacks.clone()
        };

        tracing::debug!("Listener state: {}", state);
        if state == ListenerState::Waiting(WaitReason::AddressInUse) {
            self.shared.wake.notify_one();
        }
        if let Some(callbacks) = callbacks {
            (callbacks.on_state_change)(state);
        }
    }

    async fn bind(&self, port: u16) {
        let cancel = CancellationToken::new();
        let generation = {
            let mut inner = self.inner();
            if let Some(previous) = inner.listener_cancel.replace(cancel.clone()) {
                previous.cancel();
            }
            inner.generation = inner.generation.wrapping_add(1);
            inner.port = None;
            inner.generation
        };
        self.set_state(generation, ListenerState::Starting);

        let addr = SocketAddr::new(self.shared.config.bind_addr, port);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!("Port {} is already in use", port);
                self.set_state(generation, ListenerState::Waiting(WaitReason::AddressInUse));
                return;
            }
            Err(e) => {
                tracing::error!("Failed to bind {}: {}", addr, e);
                self.set_state(generation, ListenerState::Failed(e.to_string()));
                return;
            }
        };
        if cancel.is_cancelled() {
            return;
        }

        let port = match listener.local_addr() {
            Ok(local) => local.port(),
            Err(e) => {
                self.set_state(generation, ListenerState::Failed(e.to_string()));
                return;
            }
        };
        {
            let mut inner = self.inner();
            if inner.generation != generation {
                return;
            }
            inner.port = Some(port);
            // Held across the advertisement: stop() bumps the generation under
            // this lock and withdraws only after releasing it.
            if let Err(e) = self.shared.advertiser.advertise(port) {
                tracing::warn!("{}; peers must connect by address", e);
            }
        }
        tracing::info!("Listening on {}:{}", self.shared.config.bind_addr, port);
        self.set_state(generation, ListenerState::Ready { port });

        let manager = self.clone();
        tokio::spawn(async move { manager.accept_loop(generation, listener, cancel).await });
    }

    async fn accept_loop(&self, generation: u64, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Listener generation {} cancelled", generation);
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!("Accepted connection from {}", addr);
                        let callback = self.inner().callbacks.as_ref().map(|c| c.on_new_connection.clone());
                        if let Some(on_new_connection) = callback {
                            on_new_connection(stream, addr);
                        }
                    }
                    Err(e) if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionAborted
                            | std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::Interrupted
                    ) => {
                        tracing::debug!("Transient accept error: {}", e);
                    }
                    Err(e) => {
                        tracing::error!("Listener failed: {}", e);
                        self.set_state(generation, ListenerState::Failed(e.to_string()));
                        return;
                    }
                },
            }
        }
    }

    async fn supervise(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.shared.config.health_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.shared.wake.notified() => {}
            }

            let delay = match self.state() {
                ListenerState::Failed(reason) => {
                    tracing::warn!("Listener failed ({}), rebinding", reason);
                    Duration::ZERO
                }
                ListenerState::Cancelled => {
                    tracing::warn!("Listener cancelled unexpectedly, rebinding");
                    Duration::ZERO
                }
                ListenerState::Waiting(WaitReason::AddressInUse) => self.shared.config.retry_delay,
                _ => continue,
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = async {
                    tokio::time::sleep(delay).await;
                    self.restart_with_new_port().await;
                } => {}
            }
        }
        tracing::debug!("Listener supervisor stopped");
    }
}
