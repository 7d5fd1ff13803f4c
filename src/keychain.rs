//! Biometric keychain
//!
//! Keeps one secret per service behind an access-control policy. Storing
//! replaces the previous item without a prompt; reading it back requires a
//! biometric approval.

use crate::auth::{Authenticator, Challenge, OperationKind, PromptInfo};
use crate::error::{Error, Result};
use crate::manager::into_vault_error;
use crate::vault::{AccessControl, SecretItem, SecretStore};
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Default keychain service name
pub const DEFAULT_SERVICE: &str = "com.your.app.biometric";

/// Secret storage gated by the authenticator
pub struct BiometricKeychain<S: ?Sized, A: ?Sized> {
    store: Arc<S>,
    authenticator: Arc<A>,
    service: String,
}

impl<S, A> BiometricKeychain<S, A>
where
    S: SecretStore + ?Sized,
    A: Authenticator + ?Sized,
{
    pub fn new(store: Arc<S>, authenticator: Arc<A>, service: impl Into<String>) -> Self {
        BiometricKeychain {
            store,
            authenticator,
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Replace the stored secret
    pub fn store(&self, secret: &[u8], access_control: AccessControl) -> Result<()> {
        // Delete-then-add, as platform keychains reject duplicate items
        self.store
            .remove_item(&self.service)
            .map_err(into_vault_error)?;
        self.store
            .put_item(&self.service, SecretItem::new(secret.to_vec(), access_control))
            .map_err(into_vault_error)?;

        info!("Stored keychain item for '{}' ({:?})", self.service, access_control);
        Ok(())
    }

    /// Read the secret after a biometric approval.
    ///
    /// `reason` is shown as the prompt title.
    pub async fn retrieve(&self, reason: &str) -> Result<Zeroizing<Vec<u8>>> {
        let result = self.run_retrieve(reason).await;
        if let Err(e) = &result {
            if e.is_authentication() {
                info!("Keychain read for '{}' not authorized: {}", self.service, e);
            } else {
                warn!("Keychain read for '{}' failed: {}", self.service, e);
            }
        }
        result
    }

    async fn run_retrieve(&self, reason: &str) -> Result<Zeroizing<Vec<u8>>> {
        let item = self
            .store
            .get_item(&self.service)
            .map_err(into_vault_error)?
            .ok_or_else(|| Error::KeyNotFound(self.service.clone()))?;

        let prompt = PromptInfo::default().with_title(reason);
        let item = Challenge::new(item)
            .authorize(
                self.authenticator.as_ref(),
                OperationKind::RetrieveSecret,
                &self.service,
                prompt,
            )
            .await?;

        debug!("Keychain item for '{}' released", self.service);
        Ok(item.secret)
    }

    /// Delete the stored secret. A missing item counts as removed.
    pub fn remove(&self) -> Result<()> {
        let existed = self
            .store
            .remove_item(&self.service)
            .map_err(into_vault_error)?;
        debug!("Keychain item for '{}' removed (existed: {})", self.service, existed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Decision, ScriptedAuthenticator};
    use crate::vault::{KeyVault, MemoryKeyVault};

    fn keychain() -> BiometricKeychain<MemoryKeyVault, ScriptedAuthenticator> {
        BiometricKeychain::new(
            Arc::new(MemoryKeyVault::new()),
            Arc::new(ScriptedAuthenticator::approving()),
            DEFAULT_SERVICE,
        )
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let kc = keychain();
        kc.store(b"s3cret", AccessControl::BiometryCurrentSet).unwrap();

        let secret = kc.retrieve("Unlock your secret").await.unwrap();
        assert_eq!(secret.as_slice(), b"s3cret");

        let request = &kc.authenticator.requests()[0];
        assert_eq!(request.prompt.title, "Unlock your secret");
        assert_eq!(request.operation, OperationKind::RetrieveSecret);
    }

    #[tokio::test]
    async fn test_store_replaces_previous() {
        let kc = keychain();
        kc.store(b"first", AccessControl::BiometryAny).unwrap();
        kc.store(b"second", AccessControl::BiometryAny).unwrap();

        assert_eq!(kc.retrieve("r").await.unwrap().as_slice(), b"second");
    }

    #[tokio::test]
    async fn test_denied_retrieve() {
        let kc = keychain();
        kc.store(b"s3cret", AccessControl::BiometryAny).unwrap();
        kc.authenticator.push(Decision::Deny);

        assert!(matches!(
            kc.retrieve("r").await,
            Err(Error::AuthenticationDenied)
        ));
    }

    #[tokio::test]
    async fn test_missing_item_does_not_prompt() {
        let kc = keychain();
        assert!(matches!(kc.retrieve("r").await, Err(Error::KeyNotFound(_))));
        assert_eq!(kc.authenticator.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_current_set_item_lost_on_enrollment_change() {
        let kc = keychain();
        kc.store(b"s3cret", AccessControl::BiometryCurrentSet).unwrap();

        kc.store.invalidate_enrollment().unwrap();
        assert!(matches!(kc.retrieve("r").await, Err(Error::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let kc = keychain();
        kc.remove().unwrap();

        kc.store(b"s3cret", AccessControl::BiometryAny).unwrap();
        kc.remove().unwrap();
        assert!(matches!(kc.retrieve("r").await, Err(Error::KeyNotFound(_))));
    }
}
