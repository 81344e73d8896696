//! Configuration for the `TermSync` engine and simulation binary.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/termsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use crate::transport::memory::FaultPlan;

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

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    engine: EngineFileConfig,
    backfill: BackfillFileConfig,
    simulation: SimulationFileConfig,
    identity: IdentityFileConfig,
}

/// `[engine]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EngineFileConfig {
    event_buffer: Option<usize>,
    subscription_buffer: Option<usize>,
}

/// `[backfill]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BackfillFileConfig {
    default_window_secs: Option<u64>,
    request_limit: Option<u32>,
}

/// `[simulation]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SimulationFileConfig {
    peers: Option<usize>,
    rooms: Option<Vec<String>>,
    messages_per_peer: Option<usize>,
    drop_rate: Option<f64>,
    duplicate_rate: Option<f64>,
    corrupt_rate: Option<f64>,
    settle_ms: Option<u64>,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    key_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Engine configuration (used by `Messenger`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Capacity of the event queue.
    pub event_buffer: usize,
    /// Capacity of each subscription's delivery queue.
    pub subscription_buffer: usize,
    /// Length of one backfill window.
    pub default_window: Duration,
    /// Maximum envelopes returned per chat per history request.
    pub request_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_buffer: 256,
            subscription_buffer: 256,
            default_window: Duration::from_secs(24 * 60 * 60),
            request_limit: 1000,
        }
    }
}

/// Simulation run parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Number of simulated peers.
    pub peers: usize,
    /// Public rooms every peer joins.
    pub rooms: Vec<String>,
    /// Room messages each peer sends per room.
    pub messages_per_peer: usize,
    /// Delivery faults on the simulated network.
    pub faults: FaultPlan,
    /// How long to wait for deliveries to settle before backfilling.
    pub settle: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peers: 3,
            rooms: vec!["status".to_string()],
            messages_per_peer: 5,
            faults: FaultPlan {
                drop_rate: 0.1,
                duplicate_rate: 0.1,
                corrupt_rate: 0.05,
            },
            settle: Duration::from_millis(300),
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Engine settings.
    pub engine: EngineConfig,
    /// Simulation settings.
    pub simulation: SimConfig,
    /// Key file for the first simulated peer; ephemeral keys if unset.
    pub key_file: Option<PathBuf>,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. If no `--config` is given, the default path
    /// (`~/.config/termsync/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a resolved value is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let sim = &file.simulation;

        Self {
            engine: EngineConfig {
                event_buffer: file
                    .engine
                    .event_buffer
                    .unwrap_or(defaults.engine.event_buffer),
                subscription_buffer: file
                    .engine
                    .subscription_buffer
                    .unwrap_or(defaults.engine.subscription_buffer),
                default_window: file
                    .backfill
                    .default_window_secs
                    .map_or(defaults.engine.default_window, Duration::from_secs),
                request_limit: file
                    .backfill
                    .request_limit
                    .unwrap_or(defaults.engine.request_limit),
            },
            simulation: SimConfig {
                peers: cli
                    .peers
                    .or(sim.peers)
                    .unwrap_or(defaults.simulation.peers),
                rooms: if cli.rooms.is_empty() {
                    sim.rooms.clone().unwrap_or(defaults.simulation.rooms)
                } else {
                    cli.rooms.clone()
                },
                messages_per_peer: cli
                    .messages
                    .or(sim.messages_per_peer)
                    .unwrap_or(defaults.simulation.messages_per_peer),
                faults: FaultPlan {
                    drop_rate: cli
                        .drop_rate
                        .or(sim.drop_rate)
                        .unwrap_or(defaults.simulation.faults.drop_rate),
                    duplicate_rate: sim
                        .duplicate_rate
                        .unwrap_or(defaults.simulation.faults.duplicate_rate),
                    corrupt_rate: sim
                        .corrupt_rate
                        .unwrap_or(defaults.simulation.faults.corrupt_rate),
                },
                settle: sim
                    .settle_ms
                    .map_or(defaults.simulation.settle, Duration::from_millis),
            },
            key_file: cli
                .identity_file
                .clone()
                .or_else(|| file.identity.key_file.clone()),
        }
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let faults = &self.simulation.faults;
        for (name, rate) in [
            ("drop_rate", faults.drop_rate),
            ("duplicate_rate", faults.duplicate_rate),
            ("corrupt_rate", faults.corrupt_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and 1, got {rate}"
                )));
            }
        }
        if self.simulation.peers == 0 {
            return Err(ConfigError::Invalid("peers must be at least 1".into()));
        }
        if self.engine.default_window.is_zero() {
            return Err(ConfigError::Invalid(
                "default_window_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Simulate a network of message-sync peers")]
pub struct CliArgs {
    /// Number of simulated peers.
    #[arg(long, env = "TERMSYNC_PEERS")]
    pub peers: Option<usize>,

    /// Public room to join (repeatable).
    #[arg(long = "room")]
    pub rooms: Vec<String>,

    /// Room messages each peer sends per room.
    #[arg(long)]
    pub messages: Option<usize>,

    /// Probability that a live delivery is dropped.
    #[arg(long)]
    pub drop_rate: Option<f64>,

    /// Key file for the first peer's identity.
    #[arg(long, env = "TERMSYNC_IDENTITY")]
    pub identity_file: Option<PathBuf>,

    /// Path to config file (default: `~/.config/termsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TERMSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/termsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("termsync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
