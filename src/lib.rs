//! biocrypt - Biometric-gated credential envelopes
//!
//! Encrypts and decrypts small secrets with AES-256-GCM keys held in a key
//! vault. Every use of a key is released only after the authenticator
//! approves a one-shot challenge. A method-channel surface exposes the
//! operations to an application shell.

pub mod auth;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keychain;
pub mod manager;
pub mod vault;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::auth::{Authenticator, PromptInfo};
    pub use crate::channel::{BiometricChannel, MethodCall, MethodResponse};
    pub use crate::config::Config;
    pub use crate::crypto::Envelope;
    pub use crate::error::{Error, Result};
    pub use crate::keychain::BiometricKeychain;
    pub use crate::manager::CredentialEnvelopeManager;
    pub use crate::vault::{AccessControl, KeyVault, SecretStore, Vault};
}
