//! Configuration system for the `PeerChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/peerchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transfer::DEFAULT_CHUNK_SIZE;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    transfer: TransferFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server: Option<String>,
    p2p_port: Option<u16>,
    encryption: Option<bool>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[transfer]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransferFileConfig {
    download_dir: Option<PathBuf>,
    chunk_size: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Relay server address (`host:port`).
    pub server: String,
    /// Port for the inbound peer listener; `0` picks a free port.
    pub p2p_port: u16,
    /// Whether commands, peer messages and files are sealed.
    pub encryption: bool,
    /// Timeout for outbound TCP connects.
    pub connect_timeout: Duration,
    /// How long to wait for a server response or a peer ack.
    pub request_timeout: Duration,

    // -- Transfer --
    /// Directory incoming files are written to.
    pub download_dir: PathBuf,
    /// Size of each file chunk on the wire (before sealing).
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8080".to_string(),
            p2p_port: 0,
            encryption: true,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            download_dir: PathBuf::from("downloads"),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            server: cli
                .server
                .clone()
                .or_else(|| file.network.server.clone())
                .unwrap_or(defaults.server),
            p2p_port: cli
                .p2p_port
                .or(file.network.p2p_port)
                .unwrap_or(defaults.p2p_port),
            encryption: !cli.no_encryption
                && file.network.encryption.unwrap_or(defaults.encryption),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: file
                .network
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            download_dir: cli
                .download_dir
                .clone()
                .or_else(|| file.transfer.download_dir.clone())
                .unwrap_or(defaults.download_dir),
            chunk_size: file
                .transfer
                .chunk_size
                .filter(|&n| n > 0)
                .unwrap_or(defaults.chunk_size),
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "PeerChat client: relay commands, direct messages and file transfer")]
pub struct CliArgs {
    /// Relay server address (`host:port`).
    #[arg(short, long, env = "PEERCHAT_SERVER")]
    pub server: Option<String>,

    /// Port for incoming peer messages and files.
    #[arg(short, long)]
    pub p2p_port: Option<u16>,

    /// Directory incoming files are saved to.
    #[arg(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Send everything in plaintext.
    #[arg(long)]
    pub no_encryption: bool,

    /// Path to config file (default: `~/.config/peerchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PEERCHAT_LOG")]
    pub log_level: String,

    /// Log file path (default: `<tmp>/peerchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("peerchat").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
