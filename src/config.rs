use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::docker::DockerConfig;

const ENV_PREFIX: &str = "CELLEXEC_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Docker,
    Memory,
}

impl std::str::FromStr for GatewayKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docker" => Ok(GatewayKind::Docker),
            "memory" => Ok(GatewayKind::Memory),
            other => anyhow::bail!("unknown gateway kind: {}", other),
        }
    }
}

/// Settings for one executor process.
///
/// Loaded in layers: defaults, then an optional YAML file, then `CELLEXEC_*`
/// environment variables (a `.env` file is read first), then command-line
/// flags applied by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub listen_addr: String,
    pub gateway: GatewayKind,
    pub docker: DockerConfig,
    /// Value of the owner property stamped on every sandbox.
    pub owner_name: String,

    // Capacity overrides; unset dimensions come from the gateway
    pub memory_mb: Option<i64>,
    pub disk_mb: Option<i64>,
    pub max_containers: Option<i64>,

    pub container_max_cpu_shares: u64,
    pub prune_interval_ms: u64,
    pub healthy_monitoring_interval_ms: u64,
    pub unhealthy_monitoring_interval_ms: u64,
    /// Consecutive monitor failures tolerated once a container is healthy.
    pub monitor_failure_threshold: u32,
    pub reserved_container_ttl_ms: u64,
    pub gateway_retry_interval_ms: u64,

    pub snapshot_path: Option<PathBuf>,
    pub cache_path: PathBuf,
    pub export_network_env_vars: bool,
    pub event_buffer_size: usize,

    /// Filter directives, e.g. `info` or `cellexec=debug,tower_http=warn`.
    /// `RUST_LOG` takes precedence when set.
    pub log_level: String,
    pub log_dir: String,
    /// Also write a daily-rolling file under `log_dir`.
    pub log_to_file: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1700".to_string(),
            gateway: GatewayKind::Docker,
            docker: DockerConfig::default(),
            owner_name: "executor".to_string(),
            memory_mb: None,
            disk_mb: None,
            max_containers: None,
            container_max_cpu_shares: 1024,
            prune_interval_ms: 30_000,
            healthy_monitoring_interval_ms: 30_000,
            unhealthy_monitoring_interval_ms: 500,
            monitor_failure_threshold: 1,
            reserved_container_ttl_ms: 60_000,
            gateway_retry_interval_ms: 1_000,
            snapshot_path: None,
            cache_path: PathBuf::from("/tmp/cellexec/cache"),
            export_network_env_vars: false,
            event_buffer_size: 1024,
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_to_file: true,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overlaid with `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Overrides fields from `CELLEXEC_<FIELD>` variables looked up through
    /// `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        fn parse<T: std::str::FromStr>(name: &str, value: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            value
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {}{}={:?}: {}", ENV_PREFIX, name, value, e))
        }

        if let Some(v) = var("LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = var("GATEWAY") {
            self.gateway = parse("GATEWAY", v)?;
        }
        if let Some(v) = var("DOCKER_SOCKET") {
            self.docker.socket_path = Some(v);
        }
        if let Some(v) = var("DEFAULT_ROOTFS_IMAGE") {
            self.docker.default_image = v;
        }
        if let Some(v) = var("OWNER_NAME") {
            self.owner_name = v;
        }
        if let Some(v) = var("MEMORY_MB") {
            self.memory_mb = Some(parse("MEMORY_MB", v)?);
        }
        if let Some(v) = var("DISK_MB") {
            self.disk_mb = Some(parse("DISK_MB", v)?);
        }
        if let Some(v) = var("MAX_CONTAINERS") {
            self.max_containers = Some(parse("MAX_CONTAINERS", v)?);
        }
        if let Some(v) = var("CONTAINER_MAX_CPU_SHARES") {
            self.container_max_cpu_shares = parse("CONTAINER_MAX_CPU_SHARES", v)?;
        }
        if let Some(v) = var("PRUNE_INTERVAL_MS") {
            self.prune_interval_ms = parse("PRUNE_INTERVAL_MS", v)?;
        }
        if let Some(v) = var("HEALTHY_MONITORING_INTERVAL_MS") {
            self.healthy_monitoring_interval_ms = parse("HEALTHY_MONITORING_INTERVAL_MS", v)?;
        }
        if let Some(v) = var("UNHEALTHY_MONITORING_INTERVAL_MS") {
            self.unhealthy_monitoring_interval_ms = parse("UNHEALTHY_MONITORING_INTERVAL_MS", v)?;
        }
        if let Some(v) = var("MONITOR_FAILURE_THRESHOLD") {
            self.monitor_failure_threshold = parse("MONITOR_FAILURE_THRESHOLD", v)?;
        }
        if let Some(v) = var("RESERVED_CONTAINER_TTL_MS") {
            self.reserved_container_ttl_ms = parse("RESERVED_CONTAINER_TTL_MS", v)?;
        }
        if let Some(v) = var("SNAPSHOT_PATH") {
            self.snapshot_path = Some(PathBuf::from(v));
        }
        if let Some(v) = var("CACHE_PATH") {
            self.cache_path = PathBuf::from(v);
        }
        if let Some(v) = var("EXPORT_NETWORK_ENV_VARS") {
            self.export_network_env_vars = parse("EXPORT_NETWORK_ENV_VARS", v)?;
        }
        if let Some(v) = var("EVENT_BUFFER_SIZE") {
            self.event_buffer_size = parse("EVENT_BUFFER_SIZE", v)?;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("LOG_DIR") {
            self.log_dir = v;
        }
        if let Some(v) = var("LOG_TO_FILE") {
            self.log_to_file = parse("LOG_TO_FILE", v)?;
        }

        Ok(())
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn healthy_monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.healthy_monitoring_interval_ms)
    }

    pub fn unhealthy_monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.unhealthy_monitoring_interval_ms)
    }

    pub fn reserved_container_ttl(&self) -> Duration {
        Duration::from_millis(self.reserved_container_ttl_ms)
    }

    pub fn gateway_retry_interval(&self) -> Duration {
        Duration::from_millis(self.gateway_retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_yaml_overrides_defaults() {
        let config = ExecutorConfig::from_yaml(
            r#"
gateway: memory
memory_mb: 2048
prune_interval_ms: 500
docker:
  default_image: "alpine:3"
"#,
        )
        .unwrap();

        assert_eq!(config.gateway, GatewayKind::Memory);
        assert_eq!(config.memory_mb, Some(2048));
        assert_eq!(config.prune_interval(), Duration::from_millis(500));
        assert_eq!(config.docker.default_image, "alpine:3");
        // Untouched fields keep their defaults
        assert_eq!(config.owner_name, "executor");
        assert_eq!(config.docker.name_prefix, "cellexec-");
    }

    #[test]
    fn test_env_overrides_yaml() {
        let mut config = ExecutorConfig::from_yaml("owner_name: from-yaml\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("CELLEXEC_OWNER_NAME", "from-env"),
            ("CELLEXEC_EXPORT_NETWORK_ENV_VARS", "true"),
            ("CELLEXEC_GATEWAY", "MEMORY"),
            ("CELLEXEC_LOG_LEVEL", "cellexec=debug"),
            ("CELLEXEC_LOG_TO_FILE", "false"),
            ("OWNER_NAME", "unprefixed"),
        ]
        .into_iter()
        .collect();

        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.owner_name, "from-env");
        assert!(config.export_network_env_vars);
        assert_eq!(config.gateway, GatewayKind::Memory);
        assert_eq!(config.log_level, "cellexec=debug");
        assert!(!config.log_to_file);
    }

    #[test]
    fn test_invalid_env_value_is_an_error() {
        let mut config = ExecutorConfig::default();
        let err = config
            .apply_env(|key| (key == "CELLEXEC_MEMORY_MB").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("CELLEXEC_MEMORY_MB"));
    }
}
