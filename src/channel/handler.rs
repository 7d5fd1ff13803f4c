//! Method dispatch for the biometric channel

use crate::auth::{Authenticator, PromptInfo};
use crate::channel::{
    MethodCall, MethodResponse, CODE_INVALID_ARGUMENT, CODE_INVALID_ARGUMENTS, METHOD_DECRYPT,
    METHOD_ENCRYPT, METHOD_REMOVE_KEY, METHOD_REMOVE_SECRET, METHOD_RETRIEVE_SECRET,
    METHOD_STORE_SECRET,
};
use crate::config::{ChannelConfig, PromptConfig};
use crate::crypto::Envelope;
use crate::error::Error;
use crate::keychain::BiometricKeychain;
use crate::manager::CredentialEnvelopeManager;
use crate::vault::{AccessControl, Vault};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Routes method calls to the envelope manager and the keychain
pub struct BiometricChannel<V: ?Sized, A: ?Sized> {
    name: String,
    key_name: String,
    prompts: PromptConfig,
    manager: CredentialEnvelopeManager<V, A>,
    keychain: BiometricKeychain<V, A>,
}

impl<V, A> BiometricChannel<V, A>
where
    V: Vault + ?Sized,
    A: Authenticator + ?Sized,
{
    pub fn new(
        vault: Arc<V>,
        authenticator: Arc<A>,
        channel: &ChannelConfig,
        prompts: &PromptConfig,
    ) -> Self {
        BiometricChannel {
            name: channel.name.clone(),
            key_name: channel.key_name.clone(),
            prompts: prompts.clone(),
            manager: CredentialEnvelopeManager::new(Arc::clone(&vault), Arc::clone(&authenticator)),
            keychain: BiometricKeychain::new(vault, authenticator, channel.keychain_service.clone()),
        }
    }

    /// Channel name the shell binds to
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager(&self) -> &CredentialEnvelopeManager<V, A> {
        &self.manager
    }

    pub fn keychain(&self) -> &BiometricKeychain<V, A> {
        &self.keychain
    }

    /// Handle one call. Always resolves; never panics on caller input.
    pub async fn handle(&self, call: MethodCall) -> MethodResponse {
        debug!("{} <- {}", self.name, call.method);

        match call.method.as_str() {
            METHOD_ENCRYPT => self.encrypt(&call).await,
            METHOD_DECRYPT => self.decrypt(&call).await,
            METHOD_REMOVE_KEY => self.remove_key(),
            METHOD_STORE_SECRET => self.store_secret(&call),
            METHOD_RETRIEVE_SECRET => self.retrieve_secret(&call).await,
            METHOD_REMOVE_SECRET => self.remove_secret(),
            other => {
                debug!("{}: method '{}' not implemented", self.name, other);
                MethodResponse::NotImplemented
            }
        }
    }

    fn prompt(&self, call: &MethodCall) -> PromptInfo {
        self.prompts
            .prompt_info(call.str_arg("promptTitle"), call.str_arg("promptSubtitle"))
    }

    async fn encrypt(&self, call: &MethodCall) -> MethodResponse {
        let Some(data) = call.str_arg("data") else {
            return MethodResponse::error(CODE_INVALID_ARGUMENT, "Data cannot be null");
        };

        match self
            .manager
            .encrypt(&self.key_name, data.as_bytes(), self.prompt(call))
            .await
        {
            Ok(envelope) => MethodResponse::success(json!({
                "encrypted": envelope.ciphertext_base64(),
                "iv": envelope.iv_base64(),
            })),
            Err(e) => collapse(METHOD_ENCRYPT, e),
        }
    }

    async fn decrypt(&self, call: &MethodCall) -> MethodResponse {
        let (Some(encrypted), Some(iv)) = (call.str_arg("encryptedData"), call.str_arg("iv")) else {
            return MethodResponse::error(
                CODE_INVALID_ARGUMENT,
                "Encrypted data and IV cannot be null",
            );
        };

        let envelope = match Envelope::from_base64(encrypted, iv) {
            Ok(envelope) => envelope,
            Err(e) => return collapse(METHOD_DECRYPT, e),
        };

        match self
            .manager
            .decrypt(&self.key_name, &envelope, self.prompt(call))
            .await
        {
            Ok(plaintext) => MethodResponse::success(String::from_utf8_lossy(&plaintext).into_owned()),
            Err(e) => collapse(METHOD_DECRYPT, e),
        }
    }

    fn remove_key(&self) -> MethodResponse {
        if let Err(e) = self.manager.delete_key(&self.key_name) {
            warn!("{} failed: {}", METHOD_REMOVE_KEY, e);
        }
        MethodResponse::null()
    }

    fn store_secret(&self, call: &MethodCall) -> MethodResponse {
        let (Some(secret), Some(flag)) = (call.str_arg("secret"), call.str_arg("accessControl"))
        else {
            return MethodResponse::error(CODE_INVALID_ARGUMENTS, "Invalid arguments");
        };

        match self
            .keychain
            .store(secret.as_bytes(), AccessControl::from_flag(flag))
        {
            Ok(()) => MethodResponse::success(true),
            Err(e) => {
                warn!("{} failed: {}", METHOD_STORE_SECRET, e);
                MethodResponse::success(false)
            }
        }
    }

    async fn retrieve_secret(&self, call: &MethodCall) -> MethodResponse {
        let Some(reason) = call.str_arg("reason") else {
            return MethodResponse::error(CODE_INVALID_ARGUMENTS, "Invalid reason");
        };

        match self.keychain.retrieve(reason).await {
            Ok(secret) => match std::str::from_utf8(&secret) {
                Ok(text) => MethodResponse::success(text),
                Err(_) => {
                    warn!("{}: stored secret is not UTF-8", METHOD_RETRIEVE_SECRET);
                    MethodResponse::null()
                }
            },
            Err(e) => collapse(METHOD_RETRIEVE_SECRET, e),
        }
    }

    fn remove_secret(&self) -> MethodResponse {
        match self.keychain.remove() {
            Ok(()) => MethodResponse::success(true),
            Err(e) => {
                warn!("{} failed: {}", METHOD_REMOVE_SECRET, e);
                MethodResponse::success(false)
            }
        }
    }
}

/// Caller errors stay structured; everything else is an absent result
fn collapse(method: &str, e: Error) -> MethodResponse {
    if e.is_caller_error() {
        return MethodResponse::error(CODE_INVALID_ARGUMENT, &e.to_string());
    }

    if e.is_authentication() {
        debug!("{} answered null: {}", method, e);
    } else {
        warn!("{} answered null: {}", method, e);
    }
    MethodResponse::null()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Decision, ScriptedAuthenticator};
    use crate::vault::{KeyVault, MemoryKeyVault};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::Value;

    type Channel = BiometricChannel<MemoryKeyVault, ScriptedAuthenticator>;

    fn channel() -> (Channel, Arc<MemoryKeyVault>, Arc<ScriptedAuthenticator>) {
        let vault = Arc::new(MemoryKeyVault::new());
        let auth = Arc::new(ScriptedAuthenticator::approving());
        let channel = BiometricChannel::new(
            Arc::clone(&vault),
            Arc::clone(&auth),
            &ChannelConfig::default(),
            &PromptConfig::default(),
        );
        (channel, vault, auth)
    }

    fn field<'a>(response: &'a MethodResponse, name: &str) -> &'a str {
        response.result().unwrap()[name].as_str().unwrap()
    }

    #[tokio::test]
    async fn test_encrypt_then_decrypt_secret() {
        let (channel, _, _) = channel();

        let encrypted = channel
            .handle(MethodCall::new(METHOD_ENCRYPT).arg("data", "secret"))
            .await;
        let ciphertext = field(&encrypted, "encrypted").to_string();
        let iv = field(&encrypted, "iv").to_string();
        assert!(!ciphertext.is_empty());
        assert!(!iv.is_empty());
        assert!(STANDARD.decode(&ciphertext).is_ok());
        assert_eq!(STANDARD.decode(&iv).unwrap().len(), 12);

        let decrypted = channel
            .handle(
                MethodCall::new(METHOD_DECRYPT)
                    .arg("encryptedData", ciphertext)
                    .arg("iv", iv),
            )
            .await;
        assert_eq!(decrypted, MethodResponse::success("secret"));
    }

    #[tokio::test]
    async fn test_denied_encrypt_returns_null() {
        let (channel, vault, auth) = channel();
        auth.set_default(Decision::Deny);

        let response = channel
            .handle(MethodCall::new(METHOD_ENCRYPT).arg("data", "secret"))
            .await;

        assert!(response.is_null());
        assert_eq!(vault.key_count(), 1);
        assert_eq!(vault.issued_iv_count("biometric_key"), 0);
    }

    #[tokio::test]
    async fn test_foreign_envelope_returns_null() {
        let (channel, _, _) = channel();
        channel
            .handle(MethodCall::new(METHOD_ENCRYPT).arg("data", "secret"))
            .await;

        let response = channel
            .handle(
                MethodCall::new(METHOD_DECRYPT)
                    .arg("encryptedData", STANDARD.encode([0xA5u8; 40]))
                    .arg("iv", STANDARD.encode([0x01u8; 12])),
            )
            .await;
        assert!(response.is_null());
    }

    #[tokio::test]
    async fn test_malformed_base64_returns_null() {
        let (channel, _, auth) = channel();
        let response = channel
            .handle(
                MethodCall::new(METHOD_DECRYPT)
                    .arg("encryptedData", "%%%")
                    .arg("iv", "%%%"),
            )
            .await;
        assert!(response.is_null());
        assert_eq!(auth.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_decrypt_without_key_returns_null() {
        let (channel, _, _) = channel();
        let response = channel
            .handle(
                MethodCall::new(METHOD_DECRYPT)
                    .arg("encryptedData", STANDARD.encode([0u8; 32]))
                    .arg("iv", STANDARD.encode([0u8; 12])),
            )
            .await;
        assert!(response.is_null());
    }

    #[tokio::test]
    async fn test_missing_arguments_are_errors() {
        let (channel, _, auth) = channel();

        let response = channel.handle(MethodCall::new(METHOD_ENCRYPT)).await;
        assert_eq!(
            response,
            MethodResponse::error(CODE_INVALID_ARGUMENT, "Data cannot be null")
        );

        let response = channel
            .handle(MethodCall::new(METHOD_DECRYPT).arg("encryptedData", "AAAA"))
            .await;
        assert_eq!(
            response,
            MethodResponse::error(CODE_INVALID_ARGUMENT, "Encrypted data and IV cannot be null")
        );

        let response = channel
            .handle(MethodCall::new(METHOD_STORE_SECRET).arg("secret", "x"))
            .await;
        assert_eq!(
            response,
            MethodResponse::error(CODE_INVALID_ARGUMENTS, "Invalid arguments")
        );

        let response = channel.handle(MethodCall::new(METHOD_RETRIEVE_SECRET)).await;
        assert_eq!(
            response,
            MethodResponse::error(CODE_INVALID_ARGUMENTS, "Invalid reason")
        );

        assert_eq!(auth.prompt_count(), 0);
    }

    #[tokio::test]
    async fn test_prompt_arguments_forwarded() {
        let (channel, _, auth) = channel();
        channel
            .handle(
                MethodCall::new(METHOD_ENCRYPT)
                    .arg("data", "secret")
                    .arg("promptTitle", "Unlock notes"),
            )
            .await;

        let request = &auth.requests()[0];
        assert_eq!(request.prompt.title, "Unlock notes");
        assert_eq!(request.prompt.subtitle, "Please authenticate to continue");
        assert_eq!(request.subject, "biometric_key");
    }

    #[tokio::test]
    async fn test_remove_from_keystore() {
        let (channel, vault, _) = channel();

        assert!(channel.handle(MethodCall::new(METHOD_REMOVE_KEY)).await.is_null());

        channel
            .handle(MethodCall::new(METHOD_ENCRYPT).arg("data", "secret"))
            .await;
        assert!(vault.get_key("biometric_key").unwrap().is_some());

        assert!(channel.handle(MethodCall::new(METHOD_REMOVE_KEY)).await.is_null());
        assert!(vault.get_key("biometric_key").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keychain_methods() {
        let (channel, _, auth) = channel();

        let stored = channel
            .handle(
                MethodCall::new(METHOD_STORE_SECRET)
                    .arg("secret", "pin-1234")
                    .arg("accessControl", "biometryAny"),
            )
            .await;
        assert_eq!(stored, MethodResponse::success(true));

        let retrieved = channel
            .handle(MethodCall::new(METHOD_RETRIEVE_SECRET).arg("reason", "Read your PIN"))
            .await;
        assert_eq!(retrieved, MethodResponse::success("pin-1234"));
        assert_eq!(auth.requests()[0].prompt.title, "Read your PIN");

        auth.push(Decision::Cancel);
        let cancelled = channel
            .handle(MethodCall::new(METHOD_RETRIEVE_SECRET).arg("reason", "again"))
            .await;
        assert!(cancelled.is_null());

        let removed = channel.handle(MethodCall::new(METHOD_REMOVE_SECRET)).await;
        assert_eq!(removed, MethodResponse::success(true));
        let removed_again = channel.handle(MethodCall::new(METHOD_REMOVE_SECRET)).await;
        assert_eq!(removed_again, MethodResponse::success(true));

        let missing = channel
            .handle(MethodCall::new(METHOD_RETRIEVE_SECRET).arg("reason", "gone"))
            .await;
        assert_eq!(missing.result(), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (channel, _, _) = channel();
        let response = channel.handle(MethodCall::new("wipeEverything")).await;
        assert_eq!(response, MethodResponse::NotImplemented);
    }
}
