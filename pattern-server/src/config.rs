use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use pattern_core::cluster::CoordinationConfig;
use pattern_core::{ClusterConfig, IndexConfig};
use pattern_storage::CacheConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Configuration problems that stop the server before it serves anything.
#[derive(Debug, Error)]
pub enum StartupConfigError {
    /// A config file could not be read.
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// A config file is not valid TOML for this schema.
    #[error("invalid config {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },
    /// `env` is not one of the deployment environments.
    #[error("unknown environment '{0}', expected development, staging or production")]
    UnknownEnvironment(String),
    /// Bind address or port is unusable.
    #[error("invalid bind address '{addr}': {reason}")]
    InvalidBindAddress { addr: String, reason: String },
    /// A required setting is empty.
    #[error("missing required setting '{0}'")]
    Missing(&'static str),
    /// The in-process coordinator cannot form a cluster across nodes.
    #[error("in-process coordination is only allowed in development, not {0}")]
    InMemoryCoordination(Environment),
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    #[must_use]
    pub const fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl FromStr for Environment {
    type Err = StartupConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "development" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            other => Err(StartupConfigError::UnknownEnvironment(other.to_string())),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `development`, `staging` or `production`.
    pub env: String,
    /// Address to bind and to advertise to peers.
    pub ip: String,
    /// JSON-RPC port; `ip:rpc_port` is the cluster identity.
    pub rpc_port: u16,
    /// Status port.
    pub http_port: u16,
    /// Root of the local disk tier.
    pub disk_dir: String,
    /// Pattern indexes kept in memory.
    pub index_cache_size: usize,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub index: IndexConfig,
    pub cluster: ClusterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            env: "development".to_string(),
            ip: "127.0.0.1".to_string(),
            rpc_port: 8100,
            http_port: 8101,
            disk_dir: "/usr/local/var/factors/local_disk".to_string(),
            index_cache_size: 16,
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
            cluster: ClusterConfig {
                coordination: CoordinationConfig::Memory,
                ..ClusterConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Bucket name, or the directory standing in for it in development.
    pub bucket: String,
    /// Object endpoint of the cloud tier; unused in development.
    pub cloud_endpoint: String,
    /// Bearer token for the cloud tier.
    pub cloud_token: Option<String>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "/usr/local/var/factors/cloud_storage".to_string(),
            cloud_endpoint: String::new(),
            cloud_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Built-in defaults with the file at `path` merged over them, table by
    /// table, so a partial file only replaces the keys it sets.
    pub fn load(path: Option<&Path>) -> Result<Self, StartupConfigError> {
        let mut table = parse_table(DEFAULT_CONFIG, "defaults")?;
        let mut origin = "defaults".to_string();
        if let Some(path) = path {
            origin = path.display().to_string();
            let contents = fs::read_to_string(path).map_err(|source| StartupConfigError::Read {
                path: origin.clone(),
                source,
            })?;
            merge_tables(&mut table, parse_table(&contents, &origin)?);
        }
        toml::Value::Table(table)
            .try_into()
            .map_err(|source| StartupConfigError::Parse { origin, source })
    }

    pub fn parse(contents: &str, origin: &str) -> Result<Self, StartupConfigError> {
        toml::from_str(contents).map_err(|source| StartupConfigError::Parse {
            origin: origin.to_string(),
            source,
        })
    }

    pub fn environment(&self) -> Result<Environment, StartupConfigError> {
        self.env.parse()
    }

    /// Check everything needed to start serving.
    pub fn validate(&self) -> Result<Environment, StartupConfigError> {
        let env = self.environment()?;
        self.rpc_addr()?;
        if self.rpc_port == 0 || self.http_port == 0 {
            return Err(StartupConfigError::InvalidBindAddress {
                addr: self.advertise_addr(),
                reason: "ports must be non-zero".to_string(),
            });
        }
        if self.rpc_port == self.http_port {
            return Err(StartupConfigError::InvalidBindAddress {
                addr: self.advertise_addr(),
                reason: "rpc and status ports must differ".to_string(),
            });
        }
        if self.disk_dir.is_empty() {
            return Err(StartupConfigError::Missing("disk_dir"));
        }
        if self.storage.bucket.is_empty() {
            return Err(StartupConfigError::Missing("storage.bucket"));
        }
        if !env.is_development() && self.storage.cloud_endpoint.is_empty() {
            return Err(StartupConfigError::Missing("storage.cloud_endpoint"));
        }
        if !env.is_development() && matches!(self.cluster.coordination, CoordinationConfig::Memory) {
            return Err(StartupConfigError::InMemoryCoordination(env));
        }
        Ok(env)
    }

    fn ip_addr(&self) -> Result<IpAddr, StartupConfigError> {
        self.ip
            .parse()
            .map_err(|err: std::net::AddrParseError| StartupConfigError::InvalidBindAddress {
                addr: self.ip.clone(),
                reason: err.to_string(),
            })
    }

    pub fn rpc_addr(&self) -> Result<SocketAddr, StartupConfigError> {
        Ok(SocketAddr::new(self.ip_addr()?, self.rpc_port))
    }

    pub fn http_addr(&self) -> Result<SocketAddr, StartupConfigError> {
        Ok(SocketAddr::new(self.ip_addr()?, self.http_port))
    }

    /// `ip:rpc_port`, the identity registered with the cluster.
    #[must_use]
    pub fn advertise_addr(&self) -> String {
        format!("{}:{}", self.ip, self.rpc_port)
    }
}

fn parse_table(contents: &str, origin: &str) -> Result<toml::Table, StartupConfigError> {
    contents.parse().map_err(|source| StartupConfigError::Parse {
        origin: origin.to_string(),
        source,
    })
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, incoming),
                _ => {
                    base.insert(key, toml::Value::Table(incoming));
                }
            },
            other => {
                base.insert(key, other);
            }
        }
    }
}
