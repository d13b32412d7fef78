//! Interactive approval UI.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use super::latch::ApprovalRequest;
use super::ApprovalDecision;

/// Presents approval requests to the local user.
///
/// `present` must not block: implementations hand the request off and answer
/// it later through [`ApprovalRequest::respond`]. Whether prompts for
/// different peers may be visible at the same time is up to the
/// implementation; the coordinator only guarantees one prompt per peer.
pub trait ApprovalPrompt: Send + Sync {
    fn present(&self, request: ApprovalRequest);
}

/// Terminal prompt on stdin/stderr. Shows one prompt at a time.
pub struct ConsolePrompt {
    input: Arc<Mutex<Lines<BufReader<Stdin>>>>,
}

impl ConsolePrompt {
    pub fn new() -> Self {
        Self {
            input: Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())),
        }
    }
}

impl Default for ConsolePrompt {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_answer(answer: &str) -> Option<ApprovalDecision> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalDecision::Approve),
        "a" | "always" => Some(ApprovalDecision::AlwaysTrust),
        "n" | "no" => Some(ApprovalDecision::Deny),
        _ => None,
    }
}

impl ApprovalPrompt for ConsolePrompt {
    fn present(&self, request: ApprovalRequest) {
        let input = Arc::clone(&self.input);
        tokio::spawn(async move {
            let mut lines = input.lock().await;
            let mut stderr = tokio::io::stderr();

            loop {
                // May have been answered by a timeout while queued behind another prompt.
                if request.is_resolved() {
                    return;
                }

                let question = format!(
                    "\nAllow \"{}\" to connect and use your tools? [y]es / [a]lways / [n]o: ",
                    request.identity
                );
                if stderr.write_all(question.as_bytes()).await.is_err() {
                    request.respond(ApprovalDecision::Deny);
                    return;
                }
                let _ = stderr.flush().await;

                let answer = match lines.next_line().await {
                    Ok(Some(answer)) => answer,
                    Ok(None) | Err(_) => {
                        tracing::warn!("Console closed, denying {}", request.identity);
                        request.respond(ApprovalDecision::Deny);
                        return;
                    }
                };

                if let Some(decision) = parse_answer(&answer) {
                    if !request.respond(decision) {
                        let _ = stderr
                            .write_all(b"That request is no longer pending.\n")
                            .await;
                    }
                    return;
                }
            }
        });
    }
}
