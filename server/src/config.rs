use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};

/// Command-line arguments. Only values actually passed end up in the CLI
/// layer, so unset flags never mask the TOML file or the environment.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "arena-presence", version, about = "Arena presence and broadcast coordinator")]
pub struct Cli {
    /// Port to listen on [default: 1990]
    #[arg(long, env = "ARENA_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long, env = "ARENA_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./arena.toml")]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// Shared secret for the control surface. Control is disabled when unset.
    #[arg(long, env = "ARENA_CONTROL_TOKEN", hide_env_values = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_token: Option<String>,
}

/// Effective server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,

    pub bind_address: String,

    #[serde(default)]
    pub json_logs: bool,

    #[serde(default)]
    pub generate_config: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_token: Option<String>,

    /// Presence tuning (loaded from [presence] section in TOML)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceConfig>,
}

/// Timers and buffer sizes of the presence coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Seconds between reaper passes (default: 300)
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Seconds of silence before a connection counts as stale (default: 300)
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Events kept per team/activity room for replay (default: 100)
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,

    /// Maximum age in seconds of replayed events (default: 3600)
    #[serde(default = "default_replay_window")]
    pub replay_window_secs: u64,

    /// How long broadcast ids are remembered for dedup (default: 600)
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,

    /// Client heartbeat period in seconds (default: 30)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Polling transport poll period in milliseconds (default: 2000)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            reap_interval_secs: 300,
            stale_after_secs: 300,
            recent_capacity: 100,
            replay_window_secs: 3600,
            dedup_window_secs: 600,
            heartbeat_interval_secs: 30,
            poll_interval_ms: 2000,
        }
    }
}

fn default_reap_interval() -> u64 {
    300
}

fn default_stale_after() -> u64 {
    300
}

fn default_recent_capacity() -> usize {
    100
}

fn default_replay_window() -> u64 {
    3600
}

fn default_dedup_window() -> u64 {
    600
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1990,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            generate_config: false,
            control_token: None,
            presence: Some(PresenceConfig::default()),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (ARENA_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Cli::parse();
        let toml = Toml::file(&cli.config);
        Self::layered(cli, toml)
    }

    fn layered(cli: Cli, file: impl Provider) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(file)
            .merge(Env::prefixed("ARENA_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }

    pub fn presence(&self) -> PresenceConfig {
        self.presence.clone().unwrap_or_default()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Arena Presence Coordinator Configuration
# Place this file at ./arena.toml or specify with --config <path>
# All settings can be overridden via environment variables (ARENA_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 1990)
# port = 1990

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Shared secret for POST /control and admin_freeze_control.
# Leave unset to disable the control surface. Prefer ARENA_CONTROL_TOKEN.
# control_token = ""

# ---- Presence ----
# [presence]

# Seconds between stale-connection sweeps
# reap_interval_secs = 300

# Seconds without activity before a connection is evicted
# stale_after_secs = 300

# Events kept per team/activity room and replayed to late joiners
# recent_capacity = 100
# replay_window_secs = 3600

# How long relayed broadcast ids are remembered for deduplication
# dedup_window_secs = 600

# Client-side timers used by the bundled transports
# heartbeat_interval_secs = 30
# poll_interval_ms = 2000
"#
    .to_string()
}
