//! Local user notifications.
//!
//! Delivery is best-effort: callers log failures and carry on.

use async_trait::async_trait;
use thiserror::Error;

use crate::approval::PeerIdentity;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification permission denied")]
    PermissionDenied,

    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// A trusted client was let in without a prompt.
    async fn client_connected(&self, identity: &PeerIdentity) -> Result<(), NotifyError>;

    /// Ask the OS for permission to show notifications.
    async fn request_permission(&self) -> Result<(), NotifyError>;
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn client_connected(&self, identity: &PeerIdentity) -> Result<(), NotifyError> {
        tracing::info!(peer = %identity, "Trusted client connected");
        Ok(())
    }

    async fn request_permission(&self) -> Result<(), NotifyError> {
        tracing::debug!("Notification permission requested");
        Ok(())
    }
}
