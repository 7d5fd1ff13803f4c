//! Biometric authenticator capability
//!
//! An [`Authenticator`] receives one [`ChallengeRequest`] per gated operation
//! and answers it exactly once through a one-shot channel. The operation the
//! approval unlocks is held by a [`Challenge`], which is consumed when it
//! resolves so the same approval can never run a second operation.

mod console;
mod simulated;

pub use console::ConsoleAuthenticator;
pub use simulated::{Decision, ManualAuthenticator, ScriptedAuthenticator};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// Default prompt title
pub const DEFAULT_PROMPT_TITLE: &str = "Authentication Required";

/// Default prompt subtitle
pub const DEFAULT_PROMPT_SUBTITLE: &str = "Please authenticate to continue";

/// Default negative button label
pub const DEFAULT_NEGATIVE_BUTTON: &str = "Cancel";

/// Text shown on the biometric prompt. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptInfo {
    pub title: String,
    pub subtitle: String,
    pub negative_button: String,
}

impl Default for PromptInfo {
    fn default() -> Self {
        PromptInfo {
            title: DEFAULT_PROMPT_TITLE.to_string(),
            subtitle: DEFAULT_PROMPT_SUBTITLE.to_string(),
            negative_button: DEFAULT_NEGATIVE_BUTTON.to_string(),
        }
    }
}

impl PromptInfo {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = subtitle.into();
        self
    }
}

/// What an approval would unlock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Encrypt,
    Decrypt,
    RetrieveSecret,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Encrypt => f.write_str("encrypt"),
            OperationKind::Decrypt => f.write_str("decrypt"),
            OperationKind::RetrieveSecret => f.write_str("retrieve-secret"),
        }
    }
}

/// One prompt, sent to the authenticator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    /// Random id the approval must echo back
    pub id: Uuid,
    pub operation: OperationKind,
    /// Key name or keychain service the operation touches
    pub subject: String,
    pub prompt: PromptInfo,
}

/// Terminal outcome of one prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Approved { challenge_id: Uuid },
    Denied,
    Cancelled,
    Error(String),
}

impl AuthOutcome {
    /// Approval for exactly this request
    pub fn approve(request: &ChallengeRequest) -> Self {
        AuthOutcome::Approved {
            challenge_id: request.id,
        }
    }
}

/// Platform biometric prompt
pub trait Authenticator: Send + Sync {
    /// Show a prompt for `request`.
    ///
    /// The returned receiver yields exactly one outcome. Dropping the sender
    /// without sending counts as an error. If the receiver is gone by the
    /// time the user answers, the outcome must be discarded.
    fn challenge(&self, request: ChallengeRequest) -> oneshot::Receiver<AuthOutcome>;
}

impl<T: Authenticator + ?Sized> Authenticator for Arc<T> {
    fn challenge(&self, request: ChallengeRequest) -> oneshot::Receiver<AuthOutcome> {
        (**self).challenge(request)
    }
}

/// Single-use binding between one pending operation and one approval
pub struct Challenge<T> {
    id: Uuid,
    pending: T,
}

impl<T> Challenge<T> {
    pub fn new(pending: T) -> Self {
        Challenge {
            id: Uuid::new_v4(),
            pending,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Prompt the authenticator and release the pending operation on approval
    pub async fn authorize<A: Authenticator + ?Sized>(
        self,
        authenticator: &A,
        operation: OperationKind,
        subject: &str,
        prompt: PromptInfo,
    ) -> Result<T> {
        let request = ChallengeRequest {
            id: self.id,
            operation,
            subject: subject.to_string(),
            prompt,
        };

        debug!("Challenge {} issued for {} on '{}'", self.id, operation, subject);
        let outcome = authenticator.challenge(request).await.map_err(|_| {
            Error::AuthenticationFailed("Authenticator dropped the challenge".to_string())
        })?;

        match outcome {
            AuthOutcome::Approved { challenge_id } if challenge_id == self.id => Ok(self.pending),
            AuthOutcome::Approved { challenge_id } => Err(Error::AuthenticationFailed(format!(
                "Approval for challenge {} does not match {}",
                challenge_id, self.id
            ))),
            AuthOutcome::Denied => Err(Error::AuthenticationDenied),
            AuthOutcome::Cancelled => Err(Error::AuthenticationCancelled),
            AuthOutcome::Error(reason) => Err(Error::AuthenticationFailed(reason)),
        }
    }
}

impl<T> fmt::Debug for Challenge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Challenge").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stale;

    impl Authenticator for Stale {
        fn challenge(&self, _request: ChallengeRequest) -> oneshot::Receiver<AuthOutcome> {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(AuthOutcome::Approved {
                challenge_id: Uuid::new_v4(),
            });
            rx
        }
    }

    struct Silent;

    impl Authenticator for Silent {
        fn challenge(&self, _request: ChallengeRequest) -> oneshot::Receiver<AuthOutcome> {
            let (_tx, rx) = oneshot::channel();
            rx
        }
    }

    #[tokio::test]
    async fn test_approval_releases_pending() {
        let auth = ScriptedAuthenticator::approving();
        let challenge = Challenge::new(42u32);

        let value = challenge
            .authorize(&auth, OperationKind::Encrypt, "k", PromptInfo::default())
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_outcomes_map_to_errors() {
        for (decision, check) in [
            (Decision::Deny, Error::AuthenticationDenied.to_string()),
            (Decision::Cancel, Error::AuthenticationCancelled.to_string()),
        ] {
            let auth = ScriptedAuthenticator::new(decision);
            let err = Challenge::new(())
                .authorize(&auth, OperationKind::Decrypt, "k", PromptInfo::default())
                .await
                .unwrap_err();
            assert_eq!(err.to_string(), check);
        }

        let auth = ScriptedAuthenticator::new(Decision::Fail("sensor dirty".into()));
        let err = Challenge::new(())
            .authorize(&auth, OperationKind::Decrypt, "k", PromptInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(ref m) if m == "sensor dirty"));
    }

    #[tokio::test]
    async fn test_approval_for_other_challenge_rejected() {
        let err = Challenge::new(())
            .authorize(&Stale, OperationKind::Encrypt, "k", PromptInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_failure() {
        let err = Challenge::new(())
            .authorize(&Silent, OperationKind::Encrypt, "k", PromptInfo::default())
            .await
            .unwrap_err();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_prompt_defaults() {
        let prompt = PromptInfo::default().with_title("Unlock");
        assert_eq!(prompt.title, "Unlock");
        assert_eq!(prompt.subtitle, DEFAULT_PROMPT_SUBTITLE);
        assert_eq!(prompt.negative_button, "Cancel");
    }
}
