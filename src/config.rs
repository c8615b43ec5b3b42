use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// The distinguished group used by the administrative built-in commands.
pub const ADMIN_GROUP: &str = "admin";

/// Timeout applied to commands that do not configure one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Worker pool size used when `pool` is absent or zero.
pub const DEFAULT_POOL_SIZE: usize = 20;

pub const DEFAULT_INFO_COLOR: &str = "";
pub const DEFAULT_SUCCESS_COLOR: &str = "#009900";
pub const DEFAULT_ERR_COLOR: &str = "#cc3300";

/// Environment variable that overrides the configured database path.
pub const DB_PATH_ENV: &str = "MEESEEKS_DB";

/// Authorization strategy attached to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStrategy {
    /// Anyone may run the command.
    Any,
    /// Only members of the configured groups may run the command.
    Group,
    /// Only members of the admin group may run the command.
    #[default]
    None,
}

impl AuthStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStrategy::Any => "any",
            AuthStrategy::Group => "group",
            AuthStrategy::None => "none",
        }
    }

    pub fn parse(value: &str) -> AuthStrategy {
        match value {
            "any" => AuthStrategy::Any,
            "group" => AuthStrategy::Group,
            _ => AuthStrategy::None,
        }
    }
}

/// Channel policy attached to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStrategy {
    /// The command may be invoked from any channel.
    #[default]
    Any,
    /// The command may only be invoked from the allow-listed channels or IM.
    Allowed,
}

impl ChannelStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStrategy::Any => "any",
            ChannelStrategy::Allowed => "allowed",
        }
    }

    pub fn parse(value: &str) -> ChannelStrategy {
        match value {
            "allowed" => ChannelStrategy::Allowed,
            _ => ChannelStrategy::Any,
        }
    }
}

/// Top level configuration loaded from the YAML file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub db: Database,
    #[serde(default)]
    pub pool: usize,
    #[serde(default)]
    pub commands: HashMap<String, CommandConfig>,
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub format: Format,
}

impl Config {
    /// Reads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration {}", path.display()))?;
        Config::parse(&raw)
            .with_context(|| format!("could not parse configuration {}", path.display()))
    }

    /// Parses a configuration document and applies defaults.
    pub fn parse(raw: &str) -> Result<Config> {
        let mut config: Config = serde_yaml::from_str(raw)?;

        for (name, command) in config.commands.iter() {
            debug!(
                "command {} uses auth strategy {} with timeout {:?}",
                name,
                command.auth_strategy.as_str(),
                command.timeout()
            );
        }

        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            if !path.is_empty() {
                config.db.path = PathBuf::from(path);
            }
        }

        Ok(config)
    }

    /// Effective worker pool size; zero falls back to the default of 20.
    pub fn pool_size(&self) -> usize {
        if self.pool == 0 {
            DEFAULT_POOL_SIZE
        } else {
            self.pool
        }
    }
}

/// One configured shell command.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub auth_strategy: AuthStrategy,
    #[serde(default)]
    pub channel_strategy: ChannelStrategy,
    #[serde(default)]
    pub allowed_channels: Vec<String>,
    /// Timeout in seconds; zero means the 60 second default.
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub no_handshake: bool,
    #[serde(default)]
    pub templates: HashMap<String, String>,
    #[serde(default)]
    pub help: HelpConfig,
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        if self.timeout == 0 {
            DEFAULT_COMMAND_TIMEOUT
        } else {
            Duration::from_secs(self.timeout)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelpConfig {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Reply formatting section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Format {
    #[serde(default)]
    pub colors: Colors,
    #[serde(default)]
    pub messages: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub reply_style: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Colors {
    #[serde(default = "default_info_color")]
    pub info: String,
    #[serde(default = "default_success_color")]
    pub success: String,
    #[serde(default = "default_err_color")]
    pub error: String,
}

impl Default for Colors {
    fn default() -> Colors {
        Colors {
            info: DEFAULT_INFO_COLOR.to_string(),
            success: DEFAULT_SUCCESS_COLOR.to_string(),
            error: DEFAULT_ERR_COLOR.to_string(),
        }
    }
}

fn default_info_color() -> String {
    DEFAULT_INFO_COLOR.to_string()
}

fn default_success_color() -> String {
    DEFAULT_SUCCESS_COLOR.to_string()
}

fn default_err_color() -> String {
    DEFAULT_ERR_COLOR.to_string()
}

/// Embedded database settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Database {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_db_mode")]
    pub file_mode: u32,
    /// Busy timeout in seconds.
    #[serde(default = "default_db_timeout")]
    pub timeout: u64,
}

impl Database {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for Database {
    fn default() -> Database {
        Database {
            path: default_db_path(),
            file_mode: default_db_mode(),
            timeout: default_db_timeout(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("meeseeks.db")
}

fn default_db_mode() -> u32 {
    0o600
}

fn default_db_timeout() -> u64 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_applies_command_defaults() {
        let config = Config::parse(
            r#"
commands:
  echo:
    command: echo
    arguments: ["hi"]
    auth_strategy: any
"#,
        )
        .unwrap();

        let echo = config.commands.get("echo").unwrap();
        assert_eq!(echo.command, "echo");
        assert_eq!(echo.arguments, vec!["hi".to_string()]);
        assert_eq!(echo.auth_strategy, AuthStrategy::Any);
        assert_eq!(echo.timeout(), DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(echo.channel_strategy, ChannelStrategy::Any);
        assert!(!echo.no_handshake);
    }

    #[test]
    fn parse_defaults_auth_strategy_to_none() {
        let config = Config::parse(
            r#"
commands:
  danger:
    command: rm
"#,
        )
        .unwrap();

        let danger = config.commands.get("danger").unwrap();
        assert_eq!(danger.auth_strategy, AuthStrategy::None);
    }

    #[test]
    fn parse_rejects_unknown_keys() {
        assert!(Config::parse("nonsense: true").is_err());
        assert!(Config::parse(
            r#"
commands:
  echo:
    command: echo
    shady_option: true
"#
        )
        .is_err());
    }

    #[test]
    fn pool_size_falls_back_to_default() {
        let config = Config::parse("pool: 0").unwrap();
        assert_eq!(config.pool_size(), DEFAULT_POOL_SIZE);

        let config = Config::parse("pool: 3").unwrap();
        assert_eq!(config.pool_size(), 3);
    }

    #[test]
    fn database_defaults() {
        let config = Config::parse("{}").unwrap();
        assert_eq!(config.db.path, PathBuf::from("meeseeks.db"));
        assert_eq!(config.db.file_mode, 0o600);
        assert_eq!(config.db.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn colors_have_defaults_and_overrides() {
        let config = Config::parse(
            r##"
format:
  colors:
    error: "#ff0000"
"##,
        )
        .unwrap();
        assert_eq!(config.format.colors.success, DEFAULT_SUCCESS_COLOR);
        assert_eq!(config.format.colors.error, "#ff0000");
        assert_eq!(config.format.colors.info, "");
    }
}
