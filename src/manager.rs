//! Session bookkeeping and the enablement-filtered tool catalog.
//!
//! The [`SessionManager`] is the only writer of the connection table and of
//! the enablement state. Sessions read the catalog through an
//! `Arc<ToolCatalog>` and never mutate it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;

use crate::approval::ApprovalCoordinator;
use crate::capability::{
    CapabilityBindings, CapabilityError, CapabilityRegistry, ResourceContent, ResourceTemplate,
    ToolDefinition, ToolOutput,
};
use crate::discovery::{ConnectionCallback, DiscoveryError, DiscoveryManager, StateCallback};
use crate::session::{ConnectionId, Session, SessionConfig, SessionHandle, SessionState, Transport};

/// How long a connection may take to finish the handshake and get approved.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Registered providers filtered by the global switch and per-provider
/// enablement.
pub struct ToolCatalog {
    registry: CapabilityRegistry,
    enabled: AtomicBool,
    bindings: RwLock<Arc<CapabilityBindings>>,
}

impl ToolCatalog {
    pub fn new(registry: CapabilityRegistry, enabled: bool, bindings: CapabilityBindings) -> Self {
        Self {
            registry,
            enabled: AtomicBool::new(enabled),
            bindings: RwLock::new(Arc::new(bindings)),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns true if the flag changed.
    fn set_enabled(&self, enabled: bool) -> bool {
        self.enabled.swap(enabled, Ordering::SeqCst) != enabled
    }

    fn replace_bindings(&self, bindings: CapabilityBindings) {
        let bindings = Arc::new(bindings);
        match self.bindings.write() {
            Ok(mut guard) => *guard = bindings,
            Err(poisoned) => *poisoned.into_inner() = bindings,
        }
    }

    fn bindings(&self) -> Arc<CapabilityBindings> {
        match self.bindings.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        if !self.is_enabled() {
            return Vec::new();
        }
        self.registry.list_tools(&self.bindings())
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, CapabilityError> {
        if !self.is_enabled() {
            return Err(CapabilityError::ToolNotFound(name.to_string()));
        }
        let bindings = self.bindings();
        self.registry.call_tool(&bindings, name, arguments).await
    }

    pub fn resource_templates(&self) -> Vec<ResourceTemplate> {
        if !self.is_enabled() {
            return Vec::new();
        }
        self.registry.resource_templates(&self.bindings())
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContent, CapabilityError> {
        if !self.is_enabled() {
            return Err(CapabilityError::ResourceNotFound(uri.to_string()));
        }
        let bindings = self.bindings();
        self.registry.read_resource(&bindings, uri).await
    }
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("registry", &self.registry)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub handshake_timeout: Duration,
    pub session: SessionConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            session: SessionConfig::default(),
        }
    }
}

pub struct SessionManager {
    config: ManagerConfig,
    discovery: DiscoveryManager,
    catalog: Arc<ToolCatalog>,
    approvals: ApprovalCoordinator,
    connections: Mutex<HashMap<ConnectionId, SessionHandle>>,
}

impl SessionManager {
    pub fn new(
        config: ManagerConfig,
        discovery: DiscoveryManager,
        catalog: Arc<ToolCatalog>,
        approvals: ApprovalCoordinator,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            discovery,
            catalog,
            approvals,
            connections: Mutex::new(HashMap::new()),
        })
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, SessionHandle>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn approvals(&self) -> &ApprovalCoordinator {
        &self.approvals
    }

    /// Start listening. Accepted connections become sessions.
    pub async fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let on_state_change: StateCallback =
            Arc::new(|state| tracing::info!("Listener {}", state));
        let on_new_connection: ConnectionCallback = Arc::new(move |stream, addr| {
            if let Some(manager) = manager.upgrade() {
                manager.handle_new_connection(Transport::tcp(stream, addr));
            }
        });
        self.discovery.start(on_state_change, on_new_connection).await
    }

    /// Stop listening and close every session.
    pub fn stop(&self) {
        self.discovery.stop();
        let sessions: Vec<SessionHandle> = self.connections().drain().map(|(_, h)| h).collect();
        for session in &sessions {
            session.stop();
        }
        tracing::info!("Session manager stopped, closed {} sessions", sessions.len());
    }

    pub fn local_port(&self) -> Option<u16> {
        self.discovery.local_port()
    }

    pub fn is_enabled(&self) -> bool {
        self.catalog.is_enabled()
    }

    /// Flip the global switch. Active sessions are told their tool list
    /// changed, but only if the value actually changed.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        if !self.catalog.set_enabled(enabled) {
            return false;
        }
        tracing::info!("Tool access {}", if enabled { "enabled" } else { "disabled" });
        self.notify_tools_changed();
        true
    }

    /// Swap in a new enablement table and notify active sessions.
    pub fn update_capability_bindings(&self, bindings: CapabilityBindings) {
        self.catalog.replace_bindings(bindings);
        self.notify_tools_changed();
    }

    fn notify_tools_changed(&self) -> usize {
        let sessions: Vec<SessionHandle> = self.connections().values().cloned().collect();
        let notified = sessions
            .iter()
            .filter(|session| session.notify_tools_changed())
            .count();
        tracing::debug!("Sent tools/list_changed to {} sessions", notified);
        notified
    }

    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.catalog.list_tools()
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, CapabilityError> {
        self.catalog.call_tool(name, arguments).await
    }

    /// Track a new connection and run its session. The session is removed
    /// when it ends, or when it is not active within the handshake timeout.
    pub fn handle_new_connection(self: &Arc<Self>, transport: Transport) -> ConnectionId {
        let id = ConnectionId::new();
        let peer = transport.peer().to_string();
        let (session, handle) = Session::new(
            id,
            transport,
            Arc::clone(&self.catalog),
            self.approvals.clone(),
            self.config.session.clone(),
        );
        let mut state = handle.subscribe();
        self.connections().insert(id, handle);
        tracing::info!(connection = %id, "Accepted connection from {}", peer);

        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = session.run().await;
            if let Some(manager) = manager.upgrade() {
                manager.remove_connection(id);
            }
        });

        let manager = Arc::downgrade(self);
        let timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            let settled = tokio::time::timeout(
                timeout,
                state.wait_for(|s| s.is_active() || s.is_closed()),
            )
            .await
            .is_ok();
            if settled {
                return;
            }
            if let Some(manager) = manager.upgrade() {
                if manager.remove_connection(id) {
                    tracing::warn!(connection = %id, "Handshake timed out after {:?}", timeout);
                }
            }
        });

        id
    }

    /// Stop a session and forget it. Returns false if it was already gone.
    pub fn remove_connection(&self, id: ConnectionId) -> bool {
        let removed = self.connections().remove(&id);
        match removed {
            Some(session) => {
                session.stop();
                tracing::debug!(connection = %id, "Removed connection");
                true
            }
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    pub fn session_states(&self) -> Vec<(ConnectionId, SessionState)> {
        self.connections()
            .iter()
            .map(|(id, session)| (*id, session.state()))
            .collect()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.discovery.stop();
    }
}
