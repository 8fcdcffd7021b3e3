use crate::collectors::fleet::CollectOptions;
use crate::collectors::Timeouts;
use crate::registry::{CredentialRef, HostDescriptor, HostRegistry, RegistryError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub listen: String,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectionConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default = "default_ssh_binary")]
    pub binary: String,
    #[serde(default = "default_strict_host_key_checking")]
    pub strict_host_key_checking: String,
    #[serde(default = "default_control_persist_secs")]
    pub control_persist_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: default_ssh_binary(),
            strict_host_key_checking: default_strict_host_key_checking(),
            control_persist_secs: default_control_persist_secs(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("invalid server list: {0}")]
    Registry(#[from] RegistryError),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.refresh_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "refresh_interval_secs must be >= 1".to_string(),
            ));
        }
        if self.servers.is_empty() {
            return Err(ConfigError::Validation(
                "servers must list at least one host".to_string(),
            ));
        }

        validate_collection(&self.collection)?;
        validate_ssh(&self.ssh)?;
        self.registry()?;

        Ok(())
    }

    pub fn registry(&self) -> Result<HostRegistry, RegistryError> {
        HostRegistry::new(self.servers.iter().map(ServerConfig::descriptor).collect())
    }

    pub fn collect_options(&self) -> CollectOptions {
        CollectOptions {
            max_parallel: self.collection.max_parallel,
            timeouts: Timeouts {
                connect: Duration::from_millis(self.collection.connect_timeout_ms),
                command: Duration::from_millis(self.collection.command_timeout_ms),
            },
            deadline: Duration::from_millis(self.collection.deadline_ms),
        }
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl ServerConfig {
    fn descriptor(&self) -> HostDescriptor {
        let credential = match &self.key_file {
            Some(path) => CredentialRef::KeyFile(path.clone()),
            None => CredentialRef::Agent,
        };
        HostDescriptor::new(
            self.name.trim(),
            self.host.trim(),
            self.port,
            self.username.trim(),
            credential,
        )
    }
}

fn validate_collection(cfg: &CollectionConfig) -> Result<(), ConfigError> {
    if cfg.max_parallel < 1 {
        return Err(ConfigError::Validation(
            "collection.max_parallel must be >= 1".to_string(),
        ));
    }
    if cfg.connect_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "collection.connect_timeout_ms must be > 0".to_string(),
        ));
    }
    if cfg.command_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "collection.command_timeout_ms must be > 0".to_string(),
        ));
    }
    if cfg.deadline_ms == 0 {
        return Err(ConfigError::Validation(
            "collection.deadline_ms must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_ssh(cfg: &SshConfig) -> Result<(), ConfigError> {
    if cfg.binary.trim().is_empty() {
        return Err(ConfigError::Validation(
            "ssh.binary must not be empty".to_string(),
        ));
    }
    match cfg.strict_host_key_checking.as_str() {
        "yes" | "no" | "accept-new" | "ask" | "off" => {}
        other => {
            return Err(ConfigError::Validation(format!(
                "ssh.strict_host_key_checking '{other}' is not one of yes, no, accept-new, off"
            )))
        }
    }
    if cfg.control_persist_secs < 1 {
        return Err(ConfigError::Validation(
            "ssh.control_persist_secs must be >= 1".to_string(),
        ));
    }
    Ok(())
}

const fn default_refresh_interval_secs() -> u64 {
    60
}

const fn default_max_parallel() -> usize {
    6
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_command_timeout_ms() -> u64 {
    5_000
}

const fn default_deadline_ms() -> u64 {
    60_000
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_strict_host_key_checking() -> String {
    "accept-new".to_string()
}

const fn default_control_persist_secs() -> u64 {
    30
}

const fn default_ssh_port() -> u16 {
    22
}
