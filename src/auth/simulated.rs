//! Software authenticators
//!
//! [`ScriptedAuthenticator`] answers immediately from a script.
//! [`ManualAuthenticator`] parks every prompt until someone resolves it,
//! which is how cancellation and late answers are exercised.

use crate::auth::{AuthOutcome, Authenticator, ChallengeRequest};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{oneshot, Notify};
use tracing::debug;

/// How a simulated user answers a prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Deny,
    Cancel,
    Fail(String),
}

impl Decision {
    fn outcome_for(&self, request: &ChallengeRequest) -> AuthOutcome {
        match self {
            Decision::Approve => AuthOutcome::approve(request),
            Decision::Deny => AuthOutcome::Denied,
            Decision::Cancel => AuthOutcome::Cancelled,
            Decision::Fail(reason) => AuthOutcome::Error(reason.clone()),
        }
    }
}

/// Answers each prompt from a queue, falling back to a default decision
#[derive(Debug)]
pub struct ScriptedAuthenticator {
    default: Mutex<Decision>,
    script: Mutex<VecDeque<Decision>>,
    requests: Mutex<Vec<ChallengeRequest>>,
    prompts: AtomicUsize,
}

impl ScriptedAuthenticator {
    pub fn new(default: Decision) -> Self {
        ScriptedAuthenticator {
            default: Mutex::new(default),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            prompts: AtomicUsize::new(0),
        }
    }

    pub fn approving() -> Self {
        Self::new(Decision::Approve)
    }

    pub fn denying() -> Self {
        Self::new(Decision::Deny)
    }

    /// Change the answer used once the script runs out
    pub fn set_default(&self, decision: Decision) {
        *self.default.lock() = decision;
    }

    /// Queue a one-off answer for the next prompt
    pub fn push(&self, decision: Decision) {
        self.script.lock().push_back(decision);
    }

    /// Number of prompts shown so far
    pub fn prompt_count(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }

    /// Every request received, oldest first
    pub fn requests(&self) -> Vec<ChallengeRequest> {
        self.requests.lock().clone()
    }
}

impl Authenticator for ScriptedAuthenticator {
    fn challenge(&self, request: ChallengeRequest) -> oneshot::Receiver<AuthOutcome> {
        self.prompts.fetch_add(1, Ordering::SeqCst);

        let decision = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone());
        let outcome = decision.outcome_for(&request);
        debug!("Scripted answer {:?} for challenge {}", decision, request.id);
        self.requests.lock().push(request);

        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        rx
    }
}

/// Holds prompts open until [`ManualAuthenticator::resolve_next`] is called
#[derive(Debug, Default)]
pub struct ManualAuthenticator {
    pending: Mutex<VecDeque<(ChallengeRequest, oneshot::Sender<AuthOutcome>)>>,
    arrived: Notify,
}

impl ManualAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait until at least one prompt is open
    pub async fn wait_for_prompt(&self) {
        loop {
            let notified = self.arrived.notified();
            if self.pending_count() > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Answer the oldest open prompt.
    ///
    /// Returns `false` if there was no prompt or its caller had already gone
    /// away; in the latter case the answer is discarded.
    pub fn resolve_next(&self, decision: Decision) -> bool {
        let Some((request, tx)) = self.pending.lock().pop_front() else {
            return false;
        };

        let outcome = decision.outcome_for(&request);
        match tx.send(outcome) {
            Ok(()) => true,
            Err(_) => {
                debug!("Caller left before challenge {} resolved, discarding", request.id);
                false
            }
        }
    }
}

impl Authenticator for ManualAuthenticator {
    fn challenge(&self, request: ChallengeRequest) -> oneshot::Receiver<AuthOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back((request, tx));
        self.arrived.notify_waiters();
        rx
    }
}
