//! Configuration system for the `taskboard` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/taskboard/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use taskboard_proto::status::{StatusKey, StatusSet, StatusSetError};
use taskboard_proto::task::UserId;

use crate::board::EngineConfig;
use crate::board::executor::{DEFAULT_CHANGE_BUFFER, DEFAULT_EVENT_BUFFER};
use crate::gateway::remote::RemoteOptions;

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

    /// The configured columns are invalid.
    #[error("invalid board columns: {0}")]
    Board(#[from] StatusSetError),

    /// The gateway URL is not a `ws://` or `wss://` URL.
    #[error("invalid gateway URL {url}: {reason}")]
    InvalidUrl {
        /// URL as configured.
        url: String,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    gateway: GatewayFileConfig,
    board: BoardFileConfig,
    engine: EngineFileConfig,
}

/// `[gateway]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct GatewayFileConfig {
    url: Option<String>,
    client_id: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[board]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BoardFileConfig {
    preset: Option<String>,
    columns: Option<Vec<String>>,
    default_column: Option<String>,
}

impl BoardFileConfig {
    /// Builds the column set: explicit columns win over the preset, and the
    /// CLI preset wins over both.
    fn resolve(&self, cli_preset: Option<&str>) -> Result<StatusSet, StatusSetError> {
        let default = self.default_column.as_deref().map(StatusKey::new);
        if let Some(preset) = cli_preset {
            return with_default(StatusSet::preset(preset)?, default);
        }
        match (&self.columns, &self.preset) {
            (Some(columns), _) => {
                StatusSet::new(columns.iter().map(StatusKey::new).collect(), default)
            }
            (None, Some(preset)) => with_default(StatusSet::preset(preset)?, default),
            (None, None) => with_default(StatusSet::standard(), default),
        }
    }
}

fn with_default(set: StatusSet, default: Option<StatusKey>) -> Result<StatusSet, StatusSetError> {
    match default {
        Some(default) => StatusSet::new(set.columns().to_vec(), Some(default)),
        None => Ok(set),
    }
}

/// `[engine]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EngineFileConfig {
    event_buffer: Option<usize>,
    change_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Gateway --
    /// Gateway WebSocket URL; `None` runs against an in-process demo board.
    pub gateway_url: Option<String>,
    /// Identity announced to the gateway and recorded on created tasks.
    pub client_id: String,
    /// Timeout for connecting to the gateway.
    pub connect_timeout: Duration,
    /// Timeout for each gateway request.
    pub request_timeout: Duration,

    // -- Board --
    /// Board columns.
    pub statuses: StatusSet,

    // -- Engine --
    /// Board events buffered per subscriber.
    pub event_buffer: usize,
    /// Store changes buffered per subscriber.
    pub change_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: None,
            client_id: default_client_id(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            statuses: StatusSet::standard(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            change_buffer: DEFAULT_CHANGE_BUFFER,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. If no `--config` is given, the default path
    /// (`~/.config/taskboard/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// the columns are invalid, or the gateway URL is not a WebSocket URL.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, &file)
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. This is separated from `load()` to
    /// enable unit testing without CLI parsing.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let gateway_url = cli
            .gateway_url
            .clone()
            .or_else(|| file.gateway.url.clone());
        if let Some(url) = &gateway_url {
            validate_gateway_url(url)?;
        }

        Ok(Self {
            gateway_url,
            client_id: cli
                .client_id
                .clone()
                .or_else(|| file.gateway.client_id.clone())
                .unwrap_or(defaults.client_id),
            connect_timeout: file
                .gateway
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: file
                .gateway
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            statuses: file.board.resolve(cli.preset.as_deref())?,
            event_buffer: file.engine.event_buffer.unwrap_or(defaults.event_buffer),
            change_buffer: file.engine.change_buffer.unwrap_or(defaults.change_buffer),
        })
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            statuses: self.statuses.clone(),
            actor: UserId::new(self.client_id.clone()),
            event_buffer: self.event_buffer,
            change_buffer: self.change_buffer,
        }
    }

    /// Connection settings derived from this configuration.
    #[must_use]
    pub const fn remote_options(&self) -> RemoteOptions {
        RemoteOptions {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            change_buffer: self.change_buffer,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Kanban task board with optimistic drag-and-drop ordering")]
pub struct CliArgs {
    /// WebSocket URL of the gateway (e.g. `ws://127.0.0.1:9100/ws`).
    #[arg(long, env = "TASKBOARD_GATEWAY")]
    pub gateway_url: Option<String>,

    /// Client identity announced to the gateway.
    #[arg(long, env = "TASKBOARD_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Path to config file (default: `~/.config/taskboard/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Column preset (standard, review).
    #[arg(long)]
    pub preset: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn", env = "TASKBOARD_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// What to do (default: list).
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Board commands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the board, or one column.
    List {
        /// Column to print.
        status: Option<String>,
    },
    /// Create a task at the end of a column.
    Create {
        /// Task title.
        #[arg(long)]
        title: String,
        /// Column (default: the board's default column).
        #[arg(long)]
        status: Option<String>,
        /// Priority (low, medium, high, urgent).
        #[arg(long)]
        priority: Option<String>,
        /// Assignee.
        #[arg(long)]
        assignee: Option<String>,
        /// Due date (YYYY-MM-DD).
        #[arg(long)]
        due: Option<String>,
        /// Tag (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Description.
        #[arg(long)]
        description: Option<String>,
    },
    /// Move a task to a column, at an index or next to another task.
    Move {
        /// Task id (or a unique trailing fragment of it).
        task: String,
        /// Destination column.
        status: String,
        /// Destination index (default: end of column).
        index: Option<usize>,
        /// Drop just before this task.
        #[arg(long, conflicts_with_all = ["index", "after"])]
        before: Option<String>,
        /// Drop just after this task.
        #[arg(long, conflicts_with = "index")]
        after: Option<String>,
    },
    /// Delete a task.
    Delete {
        /// Task id (or a unique trailing fragment of it).
        task: String,
    },
    /// Edit task fields other than status and position.
    Edit {
        /// Task id (or a unique trailing fragment of it).
        task: String,
        /// New title.
        #[arg(long)]
        title: Option<String>,
        /// New priority.
        #[arg(long)]
        priority: Option<String>,
        /// New assignee.
        #[arg(long, conflicts_with = "unassign")]
        assignee: Option<String>,
        /// Clear the assignee.
        #[arg(long)]
        unassign: bool,
        /// New due date (YYYY-MM-DD).
        #[arg(long, conflicts_with = "no_due")]
        due: Option<String>,
        /// Clear the due date.
        #[arg(long)]
        no_due: bool,
        /// New description.
        #[arg(long)]
        description: Option<String>,
        /// Replace tags (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Print every board event until interrupted.
    Watch,
}

impl Default for Command {
    fn default() -> Self {
        Self::List { status: None }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_client_id() -> String {
    format!("taskboard-{}", std::process::id())
}

fn validate_gateway_url(raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(invalid(format!("scheme must be ws or wss, not {other}"))),
    }
}

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
        config_dir.join("taskboard").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
