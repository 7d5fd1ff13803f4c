//! Credential envelope manager
//!
//! Owns the named-key lifecycle and drives biometric-gated encryption and
//! decryption. Each call walks one path through
//!
//! ```text
//! Idle -> KeyResolved -> CipherInitialized -> AwaitingAuthentication
//!      -> Authenticated -> ResultProduced
//!      -> Denied | Cancelled | Error -> NoResult
//! ```
//!
//! and never re-enters `AwaitingAuthentication`; a retry is a new call with
//! a new challenge and, for encryption, a new IV.

use crate::auth::{Authenticator, Challenge, OperationKind, PromptInfo};
use crate::crypto::{CipherOperation, Envelope, IvSource, KeyHandle, KeySpec, RandomIv};
use crate::error::{Error, Result};
use crate::vault::KeyVault;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress of one encrypt or decrypt call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    KeyResolved,
    CipherInitialized,
    AwaitingAuthentication,
    Authenticated,
    ResultProduced,
    Denied,
    Cancelled,
    Error,
    NoResult,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationState::ResultProduced | OperationState::NoResult)
    }
}

/// Logs state transitions for one call
struct OperationTrace<'a> {
    kind: OperationKind,
    name: &'a str,
    state: OperationState,
}

impl<'a> OperationTrace<'a> {
    fn start(kind: OperationKind, name: &'a str) -> Self {
        OperationTrace {
            kind,
            name,
            state: OperationState::Idle,
        }
    }

    fn advance(&mut self, next: OperationState) {
        debug!("{} '{}': {:?} -> {:?}", self.kind, self.name, self.state, next);
        self.state = next;
    }

    fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.advance(OperationState::ResultProduced),
            Err(e) => {
                let reason = match e {
                    Error::AuthenticationDenied => OperationState::Denied,
                    Error::AuthenticationCancelled => OperationState::Cancelled,
                    _ => OperationState::Error,
                };
                self.advance(reason);
                self.advance(OperationState::NoResult);
                if e.is_authentication() {
                    info!("{} on '{}' not authorized: {}", self.kind, self.name, e);
                } else {
                    warn!("{} on '{}' failed: {}", self.kind, self.name, e);
                }
            }
        }
        result
    }
}

/// Biometric-gated encryption over a key vault
pub struct CredentialEnvelopeManager<V: ?Sized, A: ?Sized> {
    vault: Arc<V>,
    authenticator: Arc<A>,
    ivs: Box<dyn IvSource>,
    key_spec: KeySpec,
}

impl<V, A> CredentialEnvelopeManager<V, A>
where
    V: KeyVault + ?Sized,
    A: Authenticator + ?Sized,
{
    pub fn new(vault: Arc<V>, authenticator: Arc<A>) -> Self {
        CredentialEnvelopeManager {
            vault,
            authenticator,
            ivs: Box::new(RandomIv),
            key_spec: KeySpec::default(),
        }
    }

    /// Replace the IV generator
    pub fn with_iv_source(mut self, ivs: Box<dyn IvSource>) -> Self {
        self.ivs = ivs;
        self
    }

    pub fn vault(&self) -> &Arc<V> {
        &self.vault
    }

    pub fn authenticator(&self) -> &Arc<A> {
        &self.authenticator
    }

    /// Get or create the named key
    pub fn ensure_key(&self, name: &str) -> Result<KeyHandle> {
        check_name(name)?;
        self.vault
            .ensure_key(name, self.key_spec)
            .map_err(into_vault_error)
    }

    /// Whether a key exists, without creating one
    pub fn has_key(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        Ok(self
            .vault
            .get_key(name)
            .map_err(into_vault_error)?
            .is_some())
    }

    /// Encrypt `plaintext` under the named key after a biometric approval.
    ///
    /// Creates the key on first use.
    pub async fn encrypt(
        &self,
        name: &str,
        plaintext: &[u8],
        prompt: PromptInfo,
    ) -> Result<Envelope> {
        let mut trace = OperationTrace::start(OperationKind::Encrypt, name);
        let result = self.run_encrypt(&mut trace, name, plaintext, prompt).await;
        trace.finish(result)
    }

    async fn run_encrypt(
        &self,
        trace: &mut OperationTrace<'_>,
        name: &str,
        plaintext: &[u8],
        prompt: PromptInfo,
    ) -> Result<Envelope> {
        let key = self.ensure_key(name)?;
        trace.advance(OperationState::KeyResolved);

        let operation = CipherOperation::for_encryption(Arc::clone(key.material()), self.ivs.as_ref());
        trace.advance(OperationState::CipherInitialized);

        trace.advance(OperationState::AwaitingAuthentication);
        let operation = Challenge::new(operation)
            .authorize(self.authenticator.as_ref(), OperationKind::Encrypt, name, prompt)
            .await?;
        trace.advance(OperationState::Authenticated);
        self.confirm_live(name, &key)?;

        // Recorded only once approved, so a denied call leaves nothing behind.
        let fresh = self
            .vault
            .record_iv(name, operation.iv())
            .map_err(into_vault_error)?;
        if !fresh {
            return Err(Error::Cipher(format!("IV reuse detected for key '{}'", name)));
        }

        operation.seal(plaintext)
    }

    /// Decrypt an envelope produced by [`encrypt`](Self::encrypt) under the same name
    pub async fn decrypt(
        &self,
        name: &str,
        envelope: &Envelope,
        prompt: PromptInfo,
    ) -> Result<Vec<u8>> {
        let mut trace = OperationTrace::start(OperationKind::Decrypt, name);
        let result = self.run_decrypt(&mut trace, name, envelope, prompt).await;
        trace.finish(result)
    }

    async fn run_decrypt(
        &self,
        trace: &mut OperationTrace<'_>,
        name: &str,
        envelope: &Envelope,
        prompt: PromptInfo,
    ) -> Result<Vec<u8>> {
        check_name(name)?;
        let key = self
            .vault
            .get_key(name)
            .map_err(into_vault_error)?
            .ok_or_else(|| Error::KeyNotFound(name.to_string()))?;
        trace.advance(OperationState::KeyResolved);

        let operation = CipherOperation::for_decryption(Arc::clone(key.material()), &envelope.iv)?;
        trace.advance(OperationState::CipherInitialized);

        trace.advance(OperationState::AwaitingAuthentication);
        let operation = Challenge::new(operation)
            .authorize(self.authenticator.as_ref(), OperationKind::Decrypt, name, prompt)
            .await?;
        trace.advance(OperationState::Authenticated);
        self.confirm_live(name, &key)?;

        operation.open(&envelope.ciphertext)
    }

    /// The key must still be the one the cipher was initialized with.
    ///
    /// A prompt can stay open while the key is deleted, rotated or dropped by
    /// an enrollment change; approval then releases nothing.
    fn confirm_live(&self, name: &str, key: &KeyHandle) -> Result<()> {
        match self.vault.get_key(name).map_err(into_vault_error)? {
            Some(current) if current.same_key(key) => Ok(()),
            _ => Err(Error::KeyNotFound(name.to_string())),
        }
    }

    /// Remove the named key. Not biometric-gated; absent keys are fine.
    pub fn delete_key(&self, name: &str) -> Result<()> {
        check_name(name)?;
        self.vault.delete_key(name).map_err(into_vault_error)?;
        info!("Key '{}' removed", name);
        Ok(())
    }
}

impl<V: ?Sized, A: ?Sized> fmt::Debug for CredentialEnvelopeManager<V, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialEnvelopeManager")
            .field("key_spec", &self.key_spec)
            .finish_non_exhaustive()
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("Key name cannot be empty".to_string()));
    }
    Ok(())
}

/// Storage failures surface as vault errors; lookups and caller errors pass through
pub(crate) fn into_vault_error(e: Error) -> Error {
    match e {
        Error::InvalidArgument(_) | Error::KeyNotFound(_) | Error::Vault(_) => e,
        other => Error::Vault(other.to_string()),
    }
}
