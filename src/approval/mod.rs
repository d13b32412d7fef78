//! Peer approval: trust store plus interactive, per-peer deduplicated prompts.
//!
//! The [`ApprovalCoordinator`] is an actor. All of its state (the trusted set
//! and the table of open prompts) lives inside one task and is changed only by
//! messages sent through the handle, so two connections from the same peer
//! can never race each other into two prompts.
//!
//! # Decision flow
//!
//! 1. Trusted peer: approve at once and post a "client connected" notification.
//! 2. Prompt already open for the peer: wait for that prompt's answer.
//! 3. Otherwise open a prompt. "Always trust" answers are persisted, and every
//!    waiter for the peer receives the same answer.

mod latch;
mod prompt;

pub use latch::{ApprovalRequest, ApprovalResponder};
pub use prompt::{ApprovalPrompt, ConsolePrompt};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::notify::Notifier;
use crate::settings::{SettingsError, SettingsStore};

/// Display name a client announces in its handshake. Not authenticated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerIdentity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PeerIdentity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Answer given by the user to an approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    AlwaysTrust,
    Deny,
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approve | Self::AlwaysTrust)
    }
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Approval coordinator is not running")]
    Closed,

    #[error("Failed to persist trusted clients: {0}")]
    Persist(#[from] SettingsError),
}

#[derive(Debug, Clone, Default)]
pub struct ApprovalConfig {
    /// Deny a prompt nobody answered within this long. `None` waits forever.
    pub prompt_timeout: Option<Duration>,
}

enum Command {
    Decide {
        identity: PeerIdentity,
        reply: oneshot::Sender<bool>,
    },
    Resolved {
        identity: PeerIdentity,
        prompt_id: u64,
        decision: ApprovalDecision,
    },
    Withdraw {
        identity: PeerIdentity,
    },
    IsTrusted {
        identity: PeerIdentity,
        reply: oneshot::Sender<bool>,
    },
    TrustedIdentities {
        reply: oneshot::Sender<Vec<PeerIdentity>>,
    },
    RemoveTrusted {
        identity: PeerIdentity,
        reply: oneshot::Sender<Result<bool, ApprovalError>>,
    },
    ResetTrust {
        reply: oneshot::Sender<Result<(), ApprovalError>>,
    },
    ReloadTrust {
        reply: oneshot::Sender<()>,
    },
    PendingPrompts {
        reply: oneshot::Sender<usize>,
    },
}

/// One open prompt and everybody waiting on it.
struct PendingApproval {
    prompt_id: u64,
    responder: ApprovalResponder,
    waiters: Vec<oneshot::Sender<bool>>,
}

struct Coordinator {
    trusted: BTreeSet<String>,
    pending: HashMap<PeerIdentity, PendingApproval>,
    next_prompt_id: u64,
    settings: Arc<SettingsStore>,
    prompt: Arc<dyn ApprovalPrompt>,
    notifier: Arc<dyn Notifier>,
    config: ApprovalConfig,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Coordinator {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        tracing::debug!("Approval coordinator stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Decide { identity, reply } => self.decide(identity, reply),
            Command::Resolved {
                identity,
                prompt_id,
                decision,
            } => self.resolve(identity, prompt_id, decision).await,
            Command::Withdraw { identity } => self.withdraw(&identity),
            Command::IsTrusted { identity, reply } => {
                let _ = reply.send(self.trusted.contains(identity.as_str()));
            }
            Command::TrustedIdentities { reply } => {
                let _ = reply.send(self.trusted.iter().cloned().map(PeerIdentity::from).collect());
            }
            Command::RemoveTrusted { identity, reply } => {
                let result = if self.trusted.remove(identity.as_str()) {
                    tracing::info!(peer = %identity, "Removed trusted client");
                    self.persist_trust().await.map(|_| true)
                } else {
                    Ok(false)
                };
                let _ = reply.send(result);
            }
            Command::ResetTrust { reply } => {
                self.trusted.clear();
                tracing::info!("Cleared all trusted clients");
                let _ = reply.send(self.persist_trust().await);
            }
            Command::ReloadTrust { reply } => {
                self.trusted = self.settings.trusted_clients();
                let _ = reply.send(());
            }
            Command::PendingPrompts { reply } => {
                let _ = reply.send(self.pending.len());
            }
        }
    }

    fn decide(&mut self, identity: PeerIdentity, reply: oneshot::Sender<bool>) {
        if self.trusted.contains(identity.as_str()) {
            tracing::info!(peer = %identity, "Auto-approving trusted client");
            let _ = reply.send(true);
            self.notify_connected(identity);
            return;
        }

        if let Some(pending) = self.pending.get_mut(&identity) {
            tracing::debug!(peer = %identity, "Approval already pending, queueing connection");
            pending.waiters.push(reply);
            return;
        }

        self.open_prompt(identity, reply);
    }

    fn open_prompt(&mut self, identity: PeerIdentity, reply: oneshot::Sender<bool>) {
        let Some(commands) = self.commands.upgrade() else {
            let _ = reply.send(false);
            return;
        };

        let prompt_id = self.next_prompt_id;
        self.next_prompt_id = self.next_prompt_id.wrapping_add(1);
        let (responder, decision) = ApprovalResponder::channel();

        if let Some(timeout) = self.config.prompt_timeout {
            let responder = responder.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if responder.respond(ApprovalDecision::Deny) {
                    tracing::info!(peer = %identity, "Approval prompt timed out, denying");
                }
            });
        }

        {
            let identity = identity.clone();
            tokio::spawn(async move {
                // A dropped responder counts as a denial.
                let decision = decision.await.unwrap_or(ApprovalDecision::Deny);
                let _ = commands.send(Command::Resolved {
                    identity,
                    prompt_id,
                    decision,
                });
            });
        }

        tracing::info!(peer = %identity, "Requesting approval for new client");
        self.pending.insert(
            identity.clone(),
            PendingApproval {
                prompt_id,
                responder: responder.clone(),
                waiters: vec![reply],
            },
        );
        self.prompt.present(ApprovalRequest::new(identity, responder));
    }

    async fn resolve(&mut self, identity: PeerIdentity, prompt_id: u64, decision: ApprovalDecision) {
        let Some(pending) = self.pending.remove(&identity) else {
            tracing::debug!(peer = %identity, "Ignoring decision for withdrawn prompt");
            return;
        };
        if pending.prompt_id != prompt_id {
            tracing::debug!(peer = %identity, "Ignoring decision for superseded prompt");
            self.pending.insert(identity, pending);
            return;
        }

        if decision == ApprovalDecision::AlwaysTrust && self.trusted.insert(identity.to_string()) {
            if let Err(e) = self.persist_trust().await {
                tracing::warn!(peer = %identity, "Failed to persist trust: {}", e);
            }
            self.request_notification_permission();
        }

        let approved = decision.is_approved();
        tracing::info!(
            peer = %identity,
            approved,
            waiters = pending.waiters.len(),
            "Approval resolved"
        );
        for waiter in pending.waiters {
            let _ = waiter.send(approved);
        }
    }

    /// Drop waiters whose connection went away; dismiss the prompt if none remain.
    fn withdraw(&mut self, identity: &PeerIdentity) {
        let Some(pending) = self.pending.get_mut(identity) else {
            return;
        };
        pending.waiters.retain(|waiter| !waiter.is_closed());
        if pending.waiters.is_empty() {
            if let Some(pending) = self.pending.remove(identity) {
                pending.responder.respond(ApprovalDecision::Deny);
                tracing::debug!(peer = %identity, "No connections left waiting, dismissed prompt");
            }
        }
    }

    async fn persist_trust(&self) -> Result<(), ApprovalError> {
        self.settings
            .set_trusted_clients(self.trusted.clone())
            .await
            .map_err(ApprovalError::from)
    }

    fn notify_connected(&self, identity: PeerIdentity) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.client_connected(&identity).await {
                tracing::warn!(peer = %identity, "Failed to post connection notification: {}", e);
            }
        });
    }

    fn request_notification_permission(&self) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.request_permission().await {
                tracing::warn!("Notification permission request failed: {}", e);
            }
        });
    }
}

/// Sends `Withdraw` if a `decide` call is dropped before its answer arrives.
struct PendingDecision {
    identity: Option<PeerIdentity>,
    receiver: Option<oneshot::Receiver<bool>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Drop for PendingDecision {
    fn drop(&mut self) {
        if let Some(identity) = self.identity.take() {
            // Close the receiver first so the coordinator sees this waiter as gone.
            drop(self.receiver.take());
            let _ = self.commands.send(Command::Withdraw { identity });
        }
    }
}

/// Handle to the approval actor. Cheap to clone.
#[derive(Clone)]
pub struct ApprovalCoordinator {
    commands: mpsc::UnboundedSender<Command>,
}

impl ApprovalCoordinator {
    /// Start the coordinator task. The trusted set is loaded from `settings`.
    pub fn spawn(
        settings: Arc<SettingsStore>,
        prompt: Arc<dyn ApprovalPrompt>,
        notifier: Arc<dyn Notifier>,
        config: ApprovalConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            trusted: settings.trusted_clients(),
            pending: HashMap::new(),
            next_prompt_id: 0,
            settings,
            prompt,
            notifier,
            config,
            commands: tx.downgrade(),
        };
        tokio::spawn(coordinator.run(rx));
        Self { commands: tx }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ApprovalError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ApprovalError::Closed)?;
        response.await.map_err(|_| ApprovalError::Closed)
    }

    /// Decide whether `identity` may connect. Suspends until a decision exists.
    ///
    /// Dropping the returned future withdraws this connection from the prompt.
    pub async fn decide(&self, identity: &PeerIdentity) -> Result<bool, ApprovalError> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(Command::Decide {
                identity: identity.clone(),
                reply,
            })
            .map_err(|_| ApprovalError::Closed)?;

        let mut pending = PendingDecision {
            identity: Some(identity.clone()),
            receiver: Some(receiver),
            commands: self.commands.clone(),
        };
        let receiver = pending.receiver.as_mut().ok_or(ApprovalError::Closed)?;
        let result = receiver.await.map_err(|_| ApprovalError::Closed);
        pending.identity = None;
        result
    }

    pub async fn is_trusted(&self, identity: &PeerIdentity) -> Result<bool, ApprovalError> {
        let identity = identity.clone();
        self.request(|reply| Command::IsTrusted { identity, reply }).await
    }

    pub async fn trusted_identities(&self) -> Result<Vec<PeerIdentity>, ApprovalError> {
        self.request(|reply| Command::TrustedIdentities { reply }).await
    }

    /// Returns true if the identity was trusted. Active sessions are unaffected.
    pub async fn remove_trusted_identity(&self, identity: &PeerIdentity) -> Result<bool, ApprovalError> {
        let identity = identity.clone();
        self.request(|reply| Command::RemoveTrusted { identity, reply })
            .await?
    }

    /// Forget every trusted identity. Active sessions are unaffected.
    pub async fn reset_all_trust(&self) -> Result<(), ApprovalError> {
        self.request(|reply| Command::ResetTrust { reply }).await?
    }

    /// Re-read the trusted set from the settings store.
    pub async fn reload_trust(&self) -> Result<(), ApprovalError> {
        self.request(|reply| Command::ReloadTrust { reply }).await
    }

    /// Number of peers with an open prompt.
    pub async fn pending_prompts(&self) -> Result<usize, ApprovalError> {
        self.request(|reply| Command::PendingPrompts { reply }).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Prompt double: records requests and optionally answers them at once.
    #[derive(Default)]
    pub(crate) struct ScriptedPrompt {
        pub auto: Option<ApprovalDecision>,
        pub requests: Mutex<Vec<ApprovalRequest>>,
    }

    impl ScriptedPrompt {
        pub(crate) fn answering(decision: ApprovalDecision) -> Self {
            Self {
                auto: Some(decision),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn manual() -> Self {
            Self::default()
        }

        pub(crate) fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn last(&self) -> Option<ApprovalRequest> {
            self.requests.lock().unwrap().last().cloned()
        }
    }

    impl ApprovalPrompt for ScriptedPrompt {
        fn present(&self, request: ApprovalRequest) {
            if let Some(decision) = self.auto {
                request.respond(decision);
            }
            self.requests.lock().unwrap().push(request);
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingNotifier {
        pub connected: AtomicUsize,
        pub permission: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn client_connected(&self, _identity: &PeerIdentity) -> Result<(), NotifyError> {
            self.connected.fetch_add(1, Ordering::SeqCst);
            Err(NotifyError::PermissionDenied)
        }

        async fn request_permission(&self) -> Result<(), NotifyError> {
            self.permission.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    async fn coordinator(
        dir: &std::path::Path,
        prompt: Arc<ScriptedPrompt>,
        notifier: Arc<CountingNotifier>,
        config: ApprovalConfig,
    ) -> (ApprovalCoordinator, Arc<SettingsStore>) {
        let settings = Arc::new(SettingsStore::new(dir).await);
        let coordinator = ApprovalCoordinator::spawn(settings.clone(), prompt, notifier, config);
        (coordinator, settings)
    }

    #[tokio::test]
    async fn test_trusted_peer_skips_prompt() {
        let temp = tempdir().unwrap();
        let settings = SettingsStore::new(temp.path()).await;
        settings
            .set_trusted_clients(["Agent-T".to_string()].into())
            .await
            .unwrap();

        let prompt = Arc::new(ScriptedPrompt::manual());
        let notifier = Arc::new(CountingNotifier::default());
        let (coordinator, _) =
            coordinator(temp.path(), prompt.clone(), notifier.clone(), ApprovalConfig::default()).await;

        assert!(coordinator.decide(&"Agent-T".into()).await.unwrap());
        assert_eq!(prompt.count(), 0);
        // Notification failures are logged, not surfaced.
        wait_until(|| notifier.connected.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_concurrent_attempts_share_one_prompt() {
        let temp = tempdir().unwrap();
        let prompt = Arc::new(ScriptedPrompt::manual());
        let notifier = Arc::new(CountingNotifier::default());
        let (coordinator, _) =
            coordinator(temp.path(), prompt.clone(), notifier, ApprovalConfig::default()).await;

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.decide(&"Agent-C".into()).await }
        });
        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.decide(&"Agent-C".into()).await }
        });

        wait_until(|| prompt.count() == 1).await;
        // Let the second request reach the coordinator before answering.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(prompt.count(), 1);

        assert!(prompt.last().unwrap().respond(ApprovalDecision::Approve));
        assert!(first.await.unwrap().unwrap());
        assert!(second.await.unwrap().unwrap());
        assert_eq!(prompt.count(), 1);
        assert_eq!(coordinator.pending_prompts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_always_trust_persists_and_skips_next_prompt() {
        let temp = tempdir().unwrap();
        let prompt = Arc::new(ScriptedPrompt::answering(ApprovalDecision::AlwaysTrust));
        let notifier = Arc::new(CountingNotifier::default());
        let (coordinator, settings) =
            coordinator(temp.path(), prompt.clone(), notifier.clone(), ApprovalConfig::default()).await;

        let agent: PeerIdentity = "Agent-B".into();
        assert!(coordinator.decide(&agent).await.unwrap());
        assert!(coordinator.decide(&agent).await.unwrap());

        assert_eq!(prompt.count(), 1);
        assert!(settings.trusted_clients().contains("Agent-B"));
        wait_until(|| notifier.permission.load(Ordering::SeqCst) == 1).await;

        let reopened = SettingsStore::new(temp.path()).await;
        assert!(reopened.trusted_clients().contains("Agent-B"));
    }

    #[tokio::test]
    async fn test_denial_is_not_remembered() {
        let temp = tempdir().unwrap();
        let prompt = Arc::new(ScriptedPrompt::answering(ApprovalDecision::Deny));
        let notifier = Arc::new(CountingNotifier::default());
        let (coordinator, settings) =
            coordinator(temp.path(), prompt.clone(), notifier, ApprovalConfig::default()).await;

        let agent: PeerIdentity = "Agent-A".into();
        assert!(!coordinator.decide(&agent).await.unwrap());
        assert!(!coordinator.decide(&agent).await.unwrap());

        assert_eq!(prompt.count(), 2);
        assert!(settings.trusted_clients().is_empty());
    }

    #[tokio::test]
    async fn test_one_time_approval_is_not_trusted() {
        let temp = tempdir().unwrap();
        let prompt = Arc::new(ScriptedPrompt::answering(ApprovalDecision::Approve));
        let notifier = Arc::new(CountingNotifier::default());
        let (coordinator, _) =
            coordinator(temp.path(), prompt.clone(), notifier.clone(), ApprovalConfig::default()).await;

        let agent: PeerIdentity = "Agent-O".into();
        assert!(coordinator.decide(&agent).await.unwrap());
        assert!(!coordinator.is_trusted(&agent).await.unwrap());
        assert_eq!(notifier.permission.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_and_late_answer_resolve_once() {
        let temp = tempdir().unwrap();
        let prompt = Arc::new(ScriptedPrompt::manual());
        let notifier = Arc::new(CountingNotifier::default());
        let config = ApprovalConfig {
            prompt_timeout: Some(Duration::from_millis(50)),
        };
        let (coordinator, settings) =
            coordinator(temp.path(), prompt.clone(), notifier, config).await;

        let agent: PeerIdentity = "Agent-L".into();
        assert!(!coordinator.decide(&agent).await.unwrap());

        // The user clicks "always" after the timeout already denied.
        let late = prompt.last().unwrap();
        assert!(!late.respond(ApprovalDecision::AlwaysTrust));
        assert!(settings.trusted_clients().is_empty());
        assert_eq!(coordinator.pending_prompts().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_attempt_dismisses_prompt() {
        let temp = tempdir().unwrap();
        let prompt = Arc::new(ScriptedPrompt::manual());
        let notifier = Arc::new(CountingNotifier::default());
        let (coordinator, _) =
            coordinator(temp.path(), prompt.clone(), notifier, ApprovalConfig::default()).await;

        let attempt = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.decide(&"Agent-G".into()).await }
        });
        wait_until(|| prompt.count() == 1).await;

        attempt.abort();
        let _ = attempt.await;

        let request = prompt.last().unwrap();
        wait_until(|| request.is_resolved()).await;
        assert_eq!(coordinator.pending_prompts().await.unwrap(), 0);

        // A fresh attempt gets a fresh prompt.
        let retry = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.decide(&"Agent-G".into()).await }
        });
        wait_until(|| prompt.count() == 2).await;
        prompt.last().unwrap().respond(ApprovalDecision::Approve);
        assert!(retry.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_remove_and_reset_trust() {
        let temp = tempdir().unwrap();
        let prompt = Arc::new(ScriptedPrompt::answering(ApprovalDecision::AlwaysTrust));
        let notifier = Arc::new(CountingNotifier::default());
        let (coordinator, settings) =
            coordinator(temp.path(), prompt.clone(), notifier, ApprovalConfig::default()).await;

        let a: PeerIdentity = "Agent-1".into();
        let b: PeerIdentity = "Agent-2".into();
        coordinator.decide(&a).await.unwrap();
        coordinator.decide(&b).await.unwrap();
        assert_eq!(coordinator.trusted_identities().await.unwrap(), vec![a.clone(), b.clone()]);

        assert!(coordinator.remove_trusted_identity(&a).await.unwrap());
        assert!(!coordinator.remove_trusted_identity(&a).await.unwrap());
        assert!(!settings.trusted_clients().contains("Agent-1"));

        coordinator.reset_all_trust().await.unwrap();
        assert!(settings.trusted_clients().is_empty());

        // Next attempt prompts again.
        coordinator.decide(&b).await.unwrap();
        assert_eq!(prompt.count(), 3);
    }
}
