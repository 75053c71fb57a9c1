mod client;
mod gateway;

pub use gateway::{DockerGateway, HANDLE_LABEL};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub socket_path: Option<String>,
    pub timeout_secs: u64,
    /// Image used for containers that declare no rootfs.
    pub default_image: String,
    pub name_prefix: String,
    /// Host address port bindings are published on.
    pub host_ip: String,
    pub disk_bytes: u64,
    pub max_containers: u64,
    pub stop_timeout_secs: i64,
    pub exec_poll_interval_ms: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            timeout_secs: 120,
            default_image: "busybox:latest".to_string(),
            name_prefix: "cellexec-".to_string(),
            host_ip: "0.0.0.0".to_string(),
            disk_bytes: 100 * 1024 * 1024 * 1024, // 100GB
            max_containers: 256,
            stop_timeout_secs: 0,
            exec_poll_interval_ms: 100,
        }
    }
}
