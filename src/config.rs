//! Configuration management for biocrypt

use crate::auth::{PromptInfo, DEFAULT_NEGATIVE_BUTTON, DEFAULT_PROMPT_SUBTITLE, DEFAULT_PROMPT_TITLE};
use crate::channel::DEFAULT_CHANNEL_NAME;
use crate::crypto::{KeyMaterial, KEY_SIZE};
use crate::error::{Error, Result};
use crate::keychain::DEFAULT_SERVICE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroizing;

/// Default key name used by the keystore methods
pub const DEFAULT_KEY_NAME: &str = "biometric_key";

fn default_version() -> u32 {
    1
}

/// Method channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name the shell binds to
    pub name: String,

    /// Vault key used by encrypt/decrypt/remove
    pub key_name: String,

    /// Keychain service for store/retrieve/remove secret
    pub keychain_service: String,
}

/// Biometric prompt defaults, used when a call leaves them out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub title: String,
    pub subtitle: String,
    pub negative_button: String,
}

/// Vault backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VaultBackend {
    /// Persistent sled database
    Sled,
    /// Process-lifetime only
    Memory,
}

/// Key vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub backend: VaultBackend,

    /// sled database directory
    pub path: PathBuf,

    /// File holding the hex-encoded key that seals vault records
    pub wrap_key_file: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Config version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Method channel configuration
    pub channel: ChannelConfig,

    /// Prompt defaults
    pub prompt: PromptConfig,

    /// Vault configuration
    pub vault: VaultConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path to the data directory
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("biocrypt");

        Config {
            version: default_version(),
            channel: ChannelConfig::default(),
            prompt: PromptConfig::default(),
            vault: VaultConfig {
                backend: VaultBackend::Sled,
                path: data_dir.join("vault"),
                wrap_key_file: data_dir.join("vault.key"),
            },
            logging: LoggingConfig::default(),
            data_dir,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            name: DEFAULT_CHANNEL_NAME.to_string(),
            key_name: DEFAULT_KEY_NAME.to_string(),
            keychain_service: DEFAULT_SERVICE.to_string(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        PromptConfig {
            title: DEFAULT_PROMPT_TITLE.to_string(),
            subtitle: DEFAULT_PROMPT_SUBTITLE.to_string(),
            negative_button: DEFAULT_NEGATIVE_BUTTON.to_string(),
        }
    }
}

impl PromptConfig {
    /// Prompt with the given overrides applied over the defaults
    pub fn prompt_info(&self, title: Option<&str>, subtitle: Option<&str>) -> PromptInfo {
        PromptInfo {
            title: title.unwrap_or(self.title.as_str()).to_string(),
            subtitle: subtitle.unwrap_or(self.subtitle.as_str()).to_string(),
            negative_button: self.negative_button.clone(),
        }
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl Config {
    /// Load configuration from a file (YAML or JSON), with environment variable
    /// substitution and overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let content = std::fs::read_to_string(path_ref).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let content = Self::substitute_env_vars(&content)?;

        let mut config: Config = if is_yaml(path_ref) {
            serde_yaml::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse YAML config: {}", e))
            })?
        } else {
            serde_json::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse JSON config: {}", e))
            })?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Substitute environment variables in config content
    /// Supports ${VAR_NAME} syntax
    fn substitute_env_vars(content: &str) -> Result<String> {
        let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        let mut result = content.to_string();
        for cap in re.captures_iter(content) {
            if let Ok(value) = std::env::var(&cap[1]) {
                result = result.replace(&cap[0], &value);
            }
        }

        Ok(result)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key_name) = std::env::var("BIOCRYPT_KEY_NAME") {
            let key_name = key_name.trim().to_string();
            if !key_name.is_empty() {
                self.channel.key_name = key_name;
            }
        }

        if let Ok(path) = std::env::var("BIOCRYPT_VAULT_PATH") {
            let path = path.trim();
            if !path.is_empty() {
                self.vault.path = PathBuf::from(path);
            }
        }

        if let Ok(level) = std::env::var("BIOCRYPT_LOG_LEVEL") {
            let level = level.trim().to_string();
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Save configuration to a file (format determined by extension)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();

        let content = if is_yaml(path_ref) {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
        };

        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path_ref, content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.channel.name.is_empty() {
            return Err(Error::InvalidConfig("Channel name is required".to_string()));
        }

        if self.channel.key_name.is_empty() {
            return Err(Error::InvalidConfig("Key name is required".to_string()));
        }

        if self.channel.keychain_service.is_empty() {
            return Err(Error::InvalidConfig(
                "Keychain service is required".to_string(),
            ));
        }

        if self.vault.backend == VaultBackend::Sled && self.vault.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Vault path is required for the sled backend".to_string(),
            ));
        }

        match self.logging.level.to_ascii_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(Error::InvalidConfig(format!("Unknown log level: {}", other)));
            }
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        if self.vault.backend == VaultBackend::Sled {
            std::fs::create_dir_all(&self.vault.path)?;
        }
        Ok(())
    }
}

impl VaultConfig {
    /// Read the record-sealing key, generating it on first use
    pub fn load_or_create_wrap_key(&self) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
        if self.wrap_key_file.exists() {
            let text = Zeroizing::new(std::fs::read_to_string(&self.wrap_key_file)?);
            let bytes = Zeroizing::new(
                hex::decode(text.trim())
                    .map_err(|e| Error::Config(format!("Invalid vault key file: {}", e)))?,
            );
            let material = KeyMaterial::from_slice(&bytes)?;
            return Ok(Zeroizing::new(*material.bytes()));
        }

        let material = KeyMaterial::generate();
        if let Some(parent) = self.wrap_key_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.wrap_key_file, hex::encode(material.bytes()))?;
        restrict_permissions(&self.wrap_key_file)?;

        info!("Generated vault key at {:?}", self.wrap_key_file);
        Ok(Zeroizing::new(*material.bytes()))
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
