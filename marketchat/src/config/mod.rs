//! Configuration for the `MarketChat` client.
//!
//! Layered with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/marketchat/config.toml`)
//! 4. Compiled defaults
//!
//! A missing default config file is not an error. An explicit `--config`
//! path that doesn't exist is.

use std::path::PathBuf;
use std::time::Duration;

use marketchat_proto::message::{Role, UserId};
use url::Url;

use crate::chat::store::DEFAULT_CONFIRM_TOLERANCE;
use crate::chat::{EngineConfig, Session};
use crate::gateway::rest::RestConfig;

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

    /// User id or role was not configured.
    #[error("session is not configured: set --user-id and --role")]
    MissingSession,

    /// The API URL is not a valid URL.
    #[error("invalid api url {url:?}: {source}")]
    InvalidApiUrl {
        /// The configured value.
        url: String,
        /// Parse failure.
        source: url::ParseError,
    },
}

// TOML file structs (all fields Option for partial overrides)

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
    chat: ChatFileConfig,
    ui: UiFileConfig,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    api_url: Option<String>,
    token: Option<String>,
    request_timeout_secs: Option<u64>,
    page_size: Option<u32>,
}

/// `[session]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    user_id: Option<u64>,
    role: Option<Role>,
}

/// `[chat]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    confirm_tolerance_secs: Option<u64>,
}

/// `[ui]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    timestamp_format: Option<String>,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root URL of the marketplace API.
    pub api_url: String,
    /// Bearer token for the session user.
    pub token: Option<String>,
    /// Per-request timeout enforced by the HTTP gateway.
    pub request_timeout: Duration,
    /// History page size; the server default when `None`.
    pub page_size: Option<u32>,
    /// Session user id.
    pub user_id: Option<UserId>,
    /// Session user role.
    pub role: Option<Role>,
    /// Placeholder matching window for confirmations.
    pub confirm_tolerance: Duration,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:5000".to_string(),
            token: None,
            request_timeout: Duration::from_secs(10),
            page_size: None,
            user_id: None,
            role: None,
            confirm_tolerance: DEFAULT_CONFIRM_TOLERANCE,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read,
    /// or if any config file that exists cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Configuration from CLI args and env vars alone, for when the config
    /// file is unusable.
    #[must_use]
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self::resolve(cli, &ConfigFile::default())
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.server.api_url.clone())
                .unwrap_or(defaults.api_url),
            token: cli.token.clone().or_else(|| file.server.token.clone()),
            request_timeout: file
                .server
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            page_size: cli.page_size.or(file.server.page_size),
            user_id: cli
                .user_id
                .or(file.session.user_id)
                .map(UserId::new),
            role: cli.role.or(file.session.role),
            confirm_tolerance: file
                .chat
                .confirm_tolerance_secs
                .map_or(defaults.confirm_tolerance, Duration::from_secs),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// The session identity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingSession`] unless both user id and role
    /// are configured.
    pub fn session(&self) -> Result<Session, ConfigError> {
        match (self.user_id, self.role) {
            (Some(user_id), Some(role)) => Ok(Session { user_id, role }),
            _ => Err(ConfigError::MissingSession),
        }
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub const fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            confirm_tolerance: self.confirm_tolerance,
        }
    }

    /// HTTP gateway settings derived from this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidApiUrl`] if the API URL does not parse.
    pub fn rest_config(&self) -> Result<RestConfig, ConfigError> {
        let api_url = Url::parse(&self.api_url).map_err(|source| ConfigError::InvalidApiUrl {
            url: self.api_url.clone(),
            source,
        })?;
        Ok(RestConfig {
            api_url,
            token: self.token.clone(),
            request_timeout: self.request_timeout,
            page_size: self.page_size,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Direct messaging for the farm marketplace")]
pub struct CliArgs {
    /// Root URL of the marketplace API.
    #[arg(long, env = "MARKETCHAT_API_URL")]
    pub api_url: Option<String>,

    /// Bearer token of the logged-in user.
    #[arg(long, env = "MARKETCHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Id of the logged-in user.
    #[arg(long, env = "MARKETCHAT_USER_ID")]
    pub user_id: Option<u64>,

    /// Role of the logged-in user (farmer or buyer).
    #[arg(long, env = "MARKETCHAT_ROLE")]
    pub role: Option<Role>,

    /// Open the conversation with this user on start.
    #[arg(long)]
    pub contact: Option<u64>,

    /// Messages per history page.
    #[arg(long)]
    pub page_size: Option<u32>,

    /// Path to config file (default: `~/.config/marketchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MARKETCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/marketchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Load and parse a TOML config file.
///
/// An explicit path must exist; the default path may be missing.
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
        config_dir.join("marketchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
