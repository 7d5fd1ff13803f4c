//! biocrypt - Biometric-gated credential envelopes
//!
//! Usage:
//!   biocrypt init                      - Write a config and create the vault key
//!   biocrypt encrypt <data>            - Encrypt after approval
//!   biocrypt decrypt <encrypted> <iv>  - Decrypt after approval
//!   biocrypt call '<json>'             - Run one raw method-channel call
//!   biocrypt status                    - Show configuration and vault state

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use biocrypt::{
    auth::{Authenticator, ConsoleAuthenticator, Decision, ScriptedAuthenticator},
    channel::{BiometricChannel, MethodCall},
    config::{Config, VaultBackend},
    crypto::Envelope,
    keychain::BiometricKeychain,
    manager::CredentialEnvelopeManager,
    vault::{AccessControl, MemoryKeyVault, SledKeyVault, Vault},
    Error, Result,
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "biocrypt")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Biometric-gated credential envelopes")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/biocrypt/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Use a process-lifetime vault instead of the configured one
    #[arg(long)]
    ephemeral: bool,

    /// Approve every prompt without asking
    #[arg(long, conflicts_with = "deny")]
    approve: bool,

    /// Deny every prompt without asking
    #[arg(long)]
    deny: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config and create the vault key
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Encrypt data under the vault key
    Encrypt {
        /// UTF-8 text to encrypt
        data: String,

        /// Key name (defaults to the configured one)
        #[arg(long)]
        key: Option<String>,

        /// Prompt title
        #[arg(long)]
        title: Option<String>,

        /// Prompt subtitle
        #[arg(long)]
        subtitle: Option<String>,
    },

    /// Decrypt an envelope produced by `encrypt`
    Decrypt {
        /// Base64 ciphertext
        encrypted: String,

        /// Base64 IV
        iv: String,

        /// Key name (defaults to the configured one)
        #[arg(long)]
        key: Option<String>,

        /// Prompt title
        #[arg(long)]
        title: Option<String>,

        /// Prompt subtitle
        #[arg(long)]
        subtitle: Option<String>,
    },

    /// Delete the vault key
    RemoveKey {
        /// Key name (defaults to the configured one)
        #[arg(long)]
        key: Option<String>,
    },

    /// Store a keychain secret
    StoreSecret {
        /// Secret text
        secret: String,

        /// Access control flag
        #[arg(long, default_value = "biometryCurrentSet", value_parser = ["biometryAny", "biometryCurrentSet"])]
        access_control: String,
    },

    /// Read the keychain secret after approval
    RetrieveSecret {
        /// Reason shown on the prompt
        #[arg(long, default_value = "Access your secret")]
        reason: String,
    },

    /// Delete the keychain secret
    RemoveSecret,

    /// Run one method-channel call given as JSON
    Call {
        /// e.g. '{"method":"encryptWithBiometric","arguments":{"data":"secret"}}'
        json: String,
    },

    /// Show configuration and vault state
    Status,
}

type Manager = CredentialEnvelopeManager<dyn Vault, dyn Authenticator>;

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(cli.verbose, &config);

    if let Err(e) = run_command(&cli, &config_path, config) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool, config: &Config) {
    let result = if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let log_level = if verbose {
            Level::DEBUG
        } else {
            config.logging.level.parse().unwrap_or(Level::INFO)
        };
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
    };

    if let Err(e) = result {
        eprintln!("Failed to set subscriber: {}", e);
    }
}

/// Missing config files fall back to defaults so one-off ephemeral runs work
fn load_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        return Config::load(path);
    }
    let mut config = Config::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn run_command(cli: &Cli, config_path: &PathBuf, mut config: Config) -> Result<()> {
    match &cli.command {
        Commands::Init { force } => cmd_init(config_path, &config, *force),

        Commands::Encrypt {
            data,
            key,
            title,
            subtitle,
        } => {
            if let Some(key) = key {
                config.channel.key_name = key.clone();
            }
            cmd_encrypt(cli, &config, data, title.as_deref(), subtitle.as_deref())
        }

        Commands::Decrypt {
            encrypted,
            iv,
            key,
            title,
            subtitle,
        } => {
            if let Some(key) = key {
                config.channel.key_name = key.clone();
            }
            cmd_decrypt(cli, &config, encrypted, iv, title.as_deref(), subtitle.as_deref())
        }

        Commands::RemoveKey { key } => {
            if let Some(key) = key {
                config.channel.key_name = key.clone();
            }
            cmd_remove_key(cli, &config)
        }

        Commands::StoreSecret {
            secret,
            access_control,
        } => cmd_store_secret(cli, &config, secret, access_control),

        Commands::RetrieveSecret { reason } => cmd_retrieve_secret(cli, &config, reason),

        Commands::RemoveSecret => cmd_remove_secret(cli, &config),

        Commands::Call { json } => cmd_call(cli, &config, json),

        Commands::Status => cmd_status(cli, config_path, &config),
    }
}

fn open_vault(config: &Config, ephemeral: bool) -> Result<Arc<dyn Vault>> {
    if ephemeral || config.vault.backend == VaultBackend::Memory {
        info!("Using in-memory vault; keys last for this process only");
        return Ok(Arc::new(MemoryKeyVault::new()));
    }

    config.ensure_directories()?;
    let wrap_key = config.vault.load_or_create_wrap_key()?;
    Ok(Arc::new(SledKeyVault::open(&config.vault.path, *wrap_key)?))
}

fn authenticator(cli: &Cli) -> Arc<dyn Authenticator> {
    if cli.approve {
        Arc::new(ScriptedAuthenticator::new(Decision::Approve))
    } else if cli.deny {
        Arc::new(ScriptedAuthenticator::new(Decision::Deny))
    } else {
        Arc::new(ConsoleAuthenticator::new())
    }
}

fn manager(cli: &Cli, vault: &Arc<dyn Vault>) -> Manager {
    CredentialEnvelopeManager::new(Arc::clone(vault), authenticator(cli))
}

fn keychain(cli: &Cli, config: &Config, vault: &Arc<dyn Vault>) -> BiometricKeychain<dyn Vault, dyn Authenticator> {
    BiometricKeychain::new(
        Arc::clone(vault),
        authenticator(cli),
        config.channel.keychain_service.clone(),
    )
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))
}

fn cmd_init(config_path: &PathBuf, config: &Config, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Config already exists at {:?} (use --force to overwrite)",
            config_path
        )));
    }

    info!("Initializing biocrypt...");

    config.save(config_path)?;
    config.ensure_directories()?;

    if config.vault.backend == VaultBackend::Sled {
        let vault = open_vault(config, false)?;
        let handle = vault.ensure_key(&config.channel.key_name, Default::default())?;
        vault.flush()?;
        info!(
            "Vault key '{}' ready (fingerprint {})",
            handle.name(),
            handle.fingerprint()
        );
    }

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);

    Ok(())
}

fn cmd_encrypt(
    cli: &Cli,
    config: &Config,
    data: &str,
    title: Option<&str>,
    subtitle: Option<&str>,
) -> Result<()> {
    let vault = open_vault(config, cli.ephemeral)?;
    let manager = manager(cli, &vault);
    let prompt = config.prompt.prompt_info(title, subtitle);

    let envelope = runtime()?.block_on(manager.encrypt(
        &config.channel.key_name,
        data.as_bytes(),
        prompt,
    ))?;
    vault.flush()?;

    println!("encrypted: {}", envelope.ciphertext_base64());
    println!("iv:        {}", envelope.iv_base64());
    Ok(())
}

fn cmd_decrypt(
    cli: &Cli,
    config: &Config,
    encrypted: &str,
    iv: &str,
    title: Option<&str>,
    subtitle: Option<&str>,
) -> Result<()> {
    let envelope = Envelope::from_base64(encrypted, iv)?;
    let vault = open_vault(config, cli.ephemeral)?;
    let manager = manager(cli, &vault);
    let prompt = config.prompt.prompt_info(title, subtitle);

    let plaintext = runtime()?.block_on(manager.decrypt(
        &config.channel.key_name,
        &envelope,
        prompt,
    ))?;

    println!("{}", String::from_utf8_lossy(&plaintext));
    Ok(())
}

fn cmd_remove_key(cli: &Cli, config: &Config) -> Result<()> {
    let vault = open_vault(config, cli.ephemeral)?;
    manager(cli, &vault).delete_key(&config.channel.key_name)?;
    info!("Key '{}' removed", config.channel.key_name);
    Ok(())
}

fn cmd_store_secret(cli: &Cli, config: &Config, secret: &str, access_control: &str) -> Result<()> {
    let vault = open_vault(config, cli.ephemeral)?;
    keychain(cli, config, &vault).store(secret.as_bytes(), AccessControl::from_flag(access_control))?;
    Ok(())
}

fn cmd_retrieve_secret(cli: &Cli, config: &Config, reason: &str) -> Result<()> {
    let vault = open_vault(config, cli.ephemeral)?;
    let keychain = keychain(cli, config, &vault);

    let secret = runtime()?.block_on(keychain.retrieve(reason))?;
    println!("{}", String::from_utf8_lossy(&secret));
    Ok(())
}

fn cmd_remove_secret(cli: &Cli, config: &Config) -> Result<()> {
    let vault = open_vault(config, cli.ephemeral)?;
    keychain(cli, config, &vault).remove()?;
    info!("Keychain item '{}' removed", config.channel.keychain_service);
    Ok(())
}

fn cmd_call(cli: &Cli, config: &Config, json: &str) -> Result<()> {
    let call: MethodCall = serde_json::from_str(json)?;
    let vault = open_vault(config, cli.ephemeral)?;
    let channel = BiometricChannel::new(
        Arc::clone(&vault),
        authenticator(cli),
        &config.channel,
        &config.prompt,
    );

    let response = runtime()?.block_on(channel.handle(call));
    vault.flush()?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn cmd_status(cli: &Cli, config_path: &PathBuf, config: &Config) -> Result<()> {
    println!("biocrypt Status");
    println!("===============");
    println!();
    println!("Configuration: {:?}{}", config_path, if config_path.exists() { "" } else { " (defaults)" });
    println!("Data directory: {:?}", config.data_dir);
    println!("Channel: {}", config.channel.name);
    println!("Prompt: \"{}\" / \"{}\"", config.prompt.title, config.prompt.subtitle);

    match config.vault.backend {
        VaultBackend::Memory => println!("Vault: memory"),
        VaultBackend::Sled => println!("Vault: sled at {:?}", config.vault.path),
    }

    if config.vault.backend == VaultBackend::Sled && !config.vault.wrap_key_file.exists() && !cli.ephemeral {
        println!("Vault key: not created (run 'biocrypt init')");
        return Ok(());
    }

    let vault = open_vault(config, cli.ephemeral)?;
    match vault.get_key(&config.channel.key_name) {
        Ok(Some(handle)) => println!(
            "Key '{}': present (fingerprint {}, created {})",
            handle.name(),
            handle.fingerprint(),
            handle.created_at().format("%Y-%m-%d %H:%M:%S UTC")
        ),
        Ok(None) => println!("Key '{}': absent", config.channel.key_name),
        Err(e) => {
            warn!("Could not read key: {}", e);
            println!("Key '{}': unreadable - {}", config.channel.key_name, e);
        }
    }

    match vault.get_item(&config.channel.keychain_service) {
        Ok(Some(item)) => println!(
            "Keychain item '{}': present ({:?})",
            config.channel.keychain_service, item.access_control
        ),
        Ok(None) => println!("Keychain item '{}': absent", config.channel.keychain_service),
        Err(e) => println!("Keychain item '{}': unreadable - {}", config.channel.keychain_service, e),
    }

    Ok(())
}

fn expand_tilde(path: &PathBuf) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.clone()
}
