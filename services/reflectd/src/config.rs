// Daemon configuration: CLI flags, MUSCLE_-prefixed environment overrides,
// and an optional YAML file for ops-friendly deployments.
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 2960;

#[derive(Parser, Debug, Clone)]
#[command(name = "reflectd", about = "Message-reflecting server", version)]
pub struct Cli {
    /// TCP port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT, env = "MUSCLE_PORT")]
    pub port: u16,

    /// Address to bind the listener to.
    #[arg(long, default_value = "0.0.0.0", env = "MUSCLE_BIND_ADDR")]
    pub bind_addr: IpAddr,

    /// Byte budget for each session's pending-update buffer.
    #[arg(long, default_value_t = 4 * 1024 * 1024, env = "MUSCLE_MAX_BYTES_PER_SESSION")]
    pub max_bytes_per_session: usize,

    /// Cap on tree nodes a single session may create.
    #[arg(long, default_value_t = 100_000, env = "MUSCLE_MAX_NODES_PER_SESSION")]
    pub max_nodes_per_session: u32,

    /// Largest message frame accepted from a client.
    #[arg(long, default_value_t = 16 * 1024 * 1024, env = "MUSCLE_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,

    /// Wildcard hostmasks of addresses allowed to connect; empty allows all.
    #[arg(long = "privilege", env = "MUSCLE_PRIVILEGE", value_delimiter = ',')]
    pub privilege: Vec<String>,

    /// Logging verbosity (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MUSCLE_LOG_LEVEL")]
    pub log_level: String,

    /// Bind address for the Prometheus /metrics endpoint; disabled if unset.
    #[arg(long, env = "MUSCLE_METRICS_BIND")]
    pub metrics_bind: Option<SocketAddr>,

    /// Optional YAML file whose values override flags and environment.
    #[arg(long, env = "MUSCLE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub max_bytes_per_session: usize,
    pub max_nodes_per_session: u32,
    pub max_message_size: usize,
    pub privilege: Vec<String>,
    pub log_level: String,
    pub metrics_bind: Option<SocketAddr>,
}

#[derive(Debug, Deserialize)]
struct DaemonConfigOverride {
    port: Option<u16>,
    bind_addr: Option<String>,
    max_bytes_per_session: Option<usize>,
    max_nodes_per_session: Option<u32>,
    max_message_size: Option<usize>,
    privilege: Option<Vec<String>>,
    log_level: Option<String>,
    metrics_bind: Option<String>,
}

impl DaemonConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut config = Self {
            bind_addr: cli.bind_addr,
            port: cli.port,
            max_bytes_per_session: cli.max_bytes_per_session,
            max_nodes_per_session: cli.max_nodes_per_session,
            max_message_size: cli.max_message_size,
            privilege: cli.privilege,
            log_level: cli.log_level,
            metrics_bind: cli.metrics_bind,
        };
        let Some(path) = cli.config else {
            return Ok(config);
        };
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let overrides: DaemonConfigOverride =
            serde_yaml::from_str(&contents).context("parse config yaml")?;
        if let Some(value) = overrides.port {
            config.port = value;
        }
        if let Some(value) = overrides.bind_addr {
            config.bind_addr = value.parse().context("parse bind_addr")?;
        }
        if let Some(value) = overrides.max_bytes_per_session {
            config.max_bytes_per_session = value;
        }
        if let Some(value) = overrides.max_nodes_per_session {
            config.max_nodes_per_session = value;
        }
        if let Some(value) = overrides.max_message_size {
            config.max_message_size = value;
        }
        if let Some(value) = overrides.privilege {
            config.privilege = value;
        }
        if let Some(value) = overrides.log_level {
            config.log_level = value;
        }
        if let Some(value) = overrides.metrics_bind {
            config.metrics_bind = Some(value.parse().context("parse metrics_bind")?);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_survive_without_a_config_file() {
        let cli = Cli::parse_from(["reflectd"]);
        let config = DaemonConfig::from_cli(cli).expect("config");
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.privilege.is_empty());
        assert!(config.metrics_bind.is_none());
    }

    #[test]
    fn yaml_overrides_take_precedence() {
        let dir = std::env::temp_dir().join("reflectd-config-test");
        fs::create_dir_all(&dir).expect("tempdir");
        let path = dir.join("override.yml");
        fs::write(&path, "port: 4000\nlog_level: debug\nprivilege: [\"10.*\"]\n")
            .expect("write yaml");

        let cli = Cli::parse_from([
            "reflectd",
            "--port",
            "3000",
            "--config",
            path.to_str().expect("utf8 path"),
        ]);
        let config = DaemonConfig::from_cli(cli).expect("config");
        assert_eq!(config.port, 4000);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.privilege, vec!["10.*".to_owned()]);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["reflectd", "--config", "/does/not/exist.yml"]);
        assert!(DaemonConfig::from_cli(cli).is_err());
    }
}
