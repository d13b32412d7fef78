//! Single-fire bridge between an approval prompt and the coordinator.
//!
//! A prompt hands out clones of [`ApprovalResponder`]; the UI, a timeout and
//! the coordinator may all try to answer, but only the first answer is
//! delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use super::{ApprovalDecision, PeerIdentity};

struct Latch {
    fired: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<ApprovalDecision>>>,
}

/// Answers one pending prompt. Cheap to clone; every clone shares the latch.
#[derive(Clone)]
pub struct ApprovalResponder {
    latch: Arc<Latch>,
}

impl ApprovalResponder {
    /// Create a responder and the receiver its answer will arrive on.
    pub(crate) fn channel() -> (Self, oneshot::Receiver<ApprovalDecision>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self {
            latch: Arc::new(Latch {
                fired: AtomicBool::new(false),
                sender: Mutex::new(Some(tx)),
            }),
        };
        (responder, rx)
    }

    /// Deliver `decision`. Returns false if an answer was already given.
    pub fn respond(&self, decision: ApprovalDecision) -> bool {
        if self
            .latch
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let sender = match self.latch.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            // The receiver may be gone if the coordinator already dropped the prompt.
            let _ = sender.send(decision);
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.latch.fired.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ApprovalResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalResponder")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// A request for an interactive decision about one peer.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub identity: PeerIdentity,
    responder: ApprovalResponder,
}

impl ApprovalRequest {
    pub(crate) fn new(identity: PeerIdentity, responder: ApprovalResponder) -> Self {
        Self {
            identity,
            responder,
        }
    }

    /// Answer the request. Returns false if it was already answered.
    pub fn respond(&self, decision: ApprovalDecision) -> bool {
        self.responder.respond(decision)
    }

    pub fn is_resolved(&self) -> bool {
        self.responder.is_resolved()
    }

    pub fn responder(&self) -> ApprovalResponder {
        self.responder.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_answer_wins() {
        let (responder, rx) = ApprovalResponder::channel();
        let timeout = responder.clone();

        assert!(responder.respond(ApprovalDecision::AlwaysTrust));
        assert!(!timeout.respond(ApprovalDecision::Deny));
        assert!(timeout.is_resolved());

        assert_eq!(rx.await.unwrap(), ApprovalDecision::AlwaysTrust);
    }

    #[tokio::test]
    async fn test_racing_answers_deliver_once() {
        let (responder, rx) = ApprovalResponder::channel();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let responder = responder.clone();
                tokio::spawn(async move {
                    let decision = if i % 2 == 0 {
                        ApprovalDecision::Approve
                    } else {
                        ApprovalDecision::Deny
                    };
                    responder.respond(decision)
                })
            })
            .collect();

        let mut delivered = 0;
        for handle in handles {
            if handle.await.unwrap() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
        assert!(rx.await.is_ok());
    }

    #[test]
    fn test_request_answer_reaches_receiver() {
        let (responder, rx) = ApprovalResponder::channel();
        let request = ApprovalRequest::new("Agent-L".into(), responder);

        assert!(!request.is_resolved());
        assert!(request.respond(ApprovalDecision::Deny));
        assert_eq!(tokio_test::block_on(rx).unwrap(), ApprovalDecision::Deny);
    }

    #[test]
    fn test_respond_after_receiver_dropped() {
        let (responder, rx) = ApprovalResponder::channel();
        drop(rx);
        assert!(responder.respond(ApprovalDecision::Approve));
        assert!(!responder.respond(ApprovalDecision::Approve));
    }
}
