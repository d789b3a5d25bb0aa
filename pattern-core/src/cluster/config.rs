use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Cluster coordination settings shared by the server binary and core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Root under which membership and catalog keys live.
    pub key_prefix: String,
    /// Lifetime of the membership lease; renewed every third of it.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// Cadence of the drift check comparing the snapshot with live membership.
    #[serde(with = "humantime_serde")]
    pub recompute_interval: Duration,
    /// Back-off before re-establishing a failed watch.
    #[serde(with = "humantime_serde")]
    pub watch_retry: Duration,
    /// Coordination backend.
    pub coordination: CoordinationConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            lease_ttl: default_lease_ttl(),
            recompute_interval: default_recompute_interval(),
            watch_retry: default_watch_retry(),
            coordination: CoordinationConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Prefix under which every live server registers its address.
    #[must_use]
    pub fn membership_prefix(&self) -> String {
        format!("{}/services/pattern/", self.key_prefix.trim_end_matches('/'))
    }

    #[must_use]
    pub fn membership_key(&self, addr: &str) -> String {
        format!("{}{addr}", self.membership_prefix())
    }

    /// Well-known key holding the current catalog version.
    #[must_use]
    pub fn catalog_version_key(&self) -> String {
        format!("{}/projects/version", self.key_prefix.trim_end_matches('/'))
    }

    /// Interval between lease renewals.
    #[must_use]
    pub fn keep_alive_interval(&self) -> Duration {
        (self.lease_ttl / 3).max(Duration::from_millis(100))
    }
}

/// Supported coordination backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CoordinationConfig {
    /// In-process store; single node or tests.
    Memory,
    /// etcd v3 cluster.
    Etcd {
        /// `host:port` endpoints.
        endpoints: Vec<String>,
        /// Dial timeout for the initial connection.
        #[serde(default = "default_connect_timeout", with = "humantime_serde")]
        connect_timeout: Duration,
    },
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self::Etcd {
            endpoints: vec!["localhost:2379".to_string()],
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_key_prefix() -> String {
    "/factors".to_string()
}

const fn default_lease_ttl() -> Duration {
    Duration::from_secs(10)
}

const fn default_recompute_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

const fn default_watch_retry() -> Duration {
    Duration::from_secs(2)
}

const fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn key_layout() {
        let config = ClusterConfig {
            key_prefix: "/prod/".to_string(),
            ..ClusterConfig::default()
        };
        assert_eq!(config.membership_key("10.0.0.1:8100"), "/prod/services/pattern/10.0.0.1:8100");
        assert_eq!(config.catalog_version_key(), "/prod/projects/version");
    }

    #[test]
    fn durations_parse_from_humantime() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{"lease_ttl":"4s","recompute_interval":"1m","coordination":{"type":"memory"}}"#,
        )
        .unwrap();
        assert_eq!(config.lease_ttl, Duration::from_secs(4));
        assert_eq!(config.recompute_interval, Duration::from_secs(60));
        assert!(matches!(config.coordination, CoordinationConfig::Memory));
        assert_eq!(config.keep_alive_interval(), Duration::from_nanos(1_333_333_333));
    }
}
