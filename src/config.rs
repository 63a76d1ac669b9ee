use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No instrument endpoint configured (host and port are required)")]
    MissingEndpoint,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Bounded exponential backoff applied when opening the connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Per-session settings. `voltage_divider_installed` describes the deployed
/// electronics and is fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub voltage_divider_installed: bool,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// How long to keep collecting segments of a response after the first.
    pub frame_settle_ms: u64,
    pub reconnect: ReconnectPolicy,
    pub audit_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            voltage_divider_installed: false,
            connect_timeout_ms: 5000,
            io_timeout_ms: 5000,
            frame_settle_ms: 50,
            reconnect: ReconnectPolicy::default(),
            audit_dir: None,
        }
    }
}

impl SessionConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Self::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading session config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() || self.port == 0 {
            return Err(ConfigError::MissingEndpoint);
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn frame_settle(&self) -> Duration {
        Duration::from_millis(self.frame_settle_ms)
    }
}

pub const USAGE: &str = "\
Usage: cryoboss-client [OPTIONS] --setpoint <KELVIN>

Options:
  --config <PATH>        JSON session config file
  --host <ADDR>          Instrument host (overrides config)
  --port <PORT>          Instrument port (overrides config)
  --voltage-divider      Voltage divider is installed in the ADR electronics
  --audit-dir <DIR>      Append proposal outcomes as CSV under DIR
  --setpoint <KELVIN>    FAA setpoint to propose
  --log-dir <DIR>        Directory for rolling log files (default: logs)
  --json-logs            Emit console logs as JSON
  --help                 Show this message";

/// Command line for the `cryoboss-client` binary.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    pub show_help: bool,
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub voltage_divider: bool,
    pub audit_dir: Option<PathBuf>,
    pub setpoint: Option<f64>,
    pub log_dir: PathBuf,
    pub json_logs: bool,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            show_help: false,
            config_path: None,
            host: None,
            port: None,
            voltage_divider: false,
            audit_dir: None,
            setpoint: None,
            log_dir: PathBuf::from("logs"),
            json_logs: false,
        }
    }
}

impl CliArgs {
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_args(&args)
    }

    /// Parse `args`, where `args[0]` is the program name.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cli = CliArgs::default();
        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--help" | "-h" => cli.show_help = true,
                "--voltage-divider" => cli.voltage_divider = true,
                "--json-logs" => cli.json_logs = true,
                "--config" | "--host" | "--port" | "--audit-dir" | "--setpoint" | "--log-dir" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| ConfigError::InvalidArgument(format!("{flag} requires a value")))?;
                    i += 1;
                    match flag {
                        "--config" => cli.config_path = Some(PathBuf::from(value)),
                        "--host" => cli.host = Some(value.clone()),
                        "--port" => {
                            cli.port = Some(value.parse().map_err(|_| {
                                ConfigError::InvalidArgument(format!("invalid port '{value}'"))
                            })?)
                        }
                        "--audit-dir" => cli.audit_dir = Some(PathBuf::from(value)),
                        "--setpoint" => {
                            cli.setpoint = Some(value.parse().map_err(|_| {
                                ConfigError::InvalidArgument(format!("invalid setpoint '{value}'"))
                            })?)
                        }
                        _ => cli.log_dir = PathBuf::from(value),
                    }
                }
                other => {
                    return Err(ConfigError::InvalidArgument(format!("unknown option '{other}'")));
                }
            }
            i += 1;
        }
        Ok(cli)
    }

    /// Config file (if any) with command-line overrides applied.
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let mut config = match &self.config_path {
            Some(path) => SessionConfig::from_json_file(path)?,
            None => SessionConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.voltage_divider {
            config.voltage_divider_installed = true;
        }
        if let Some(dir) = &self.audit_dir {
            config.audit_dir = Some(dir.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("cryoboss-client")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn json_fills_defaults() {
        let config = SessionConfig::from_json_str(r#"{"host": "10.0.0.5", "port": 50326}"#).unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 50326);
        assert!(!config.voltage_divider_installed);
        assert_eq!(config.io_timeout(), Duration::from_secs(5));
        assert_eq!(config.frame_settle(), Duration::from_millis(50));
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        let config = SessionConfig::from_json_str("{}").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingEndpoint)));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            initial_backoff_ms: 250,
            max_backoff_ms: 1500,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(3), Duration::from_millis(1000));
        assert_eq!(policy.backoff(4), Duration::from_millis(1500));
        assert_eq!(policy.backoff(64), Duration::from_millis(1500));
    }

    #[test]
    fn parses_flags() {
        let cli = CliArgs::from_args(&args(&[
            "--host", "192.168.1.20", "--port", "50326", "--voltage-divider", "--setpoint", "0.1",
        ]))
        .unwrap();
        assert_eq!(cli.host.as_deref(), Some("192.168.1.20"));
        assert_eq!(cli.port, Some(50326));
        assert!(cli.voltage_divider);
        assert_eq!(cli.setpoint, Some(0.1));

        let config = cli.session_config().unwrap();
        assert!(config.voltage_divider_installed);
        assert_eq!(config.port, 50326);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(CliArgs::from_args(&args(&["--port", "seventy"])).is_err());
        assert!(CliArgs::from_args(&args(&["--setpoint"])).is_err());
        assert!(CliArgs::from_args(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"host": "10.0.0.5", "port": 4000, "reconnect": {{"max_attempts": 1}}}}"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let cli = CliArgs::from_args(&args(&["--config", &path, "--port", "4001"])).unwrap();
        let config = cli.session_config().unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 4001);
        assert_eq!(config.reconnect.max_attempts, 1);
        assert_eq!(config.reconnect.initial_backoff_ms, 250);
    }
}
