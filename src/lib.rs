//! # toolbridge
//!
//! Exposes local capability providers to peers on the network over MCP.
//!
//! ## Architecture
//!
//! ```text
//!   DiscoveryManager ──accept──▶ SessionManager ──spawn──▶ Session
//!   (listener + DNS-SD)          (connections,               │
//!                                 enablement)                │ initialize
//!                                      │                     ▼
//!                                      │             ApprovalCoordinator
//!                                      │             (trust store, prompts)
//!                                      ▼
//!                                 ToolCatalog ──▶ CapabilityRegistry ──▶ providers
//! ```
//!
//! ## Connection flow
//! 1. The listener accepts a connection and the manager starts a session
//! 2. The peer sends `initialize`; its client name is the peer identity
//! 3. Trusted peers pass at once, everyone else is put to the local user
//! 4. Approved sessions serve tools from every enabled provider
//! 5. Enablement changes reach active sessions as `tools/list_changed`

pub mod approval;
pub mod capability;
pub mod config;
pub mod discovery;
pub mod manager;
pub mod mcp;
pub mod notify;
pub mod session;
pub mod settings;

pub use approval::{ApprovalCoordinator, ApprovalDecision, PeerIdentity};
pub use capability::{CapabilityProvider, CapabilityRegistry};
pub use config::Config;
pub use discovery::DiscoveryManager;
pub use manager::{SessionManager, ToolCatalog};
pub use settings::SettingsStore;
