use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding};
use bytes::Bytes;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use super::client::DockerClient;
use super::DockerConfig;
use crate::gateway::{
    ByteStream, Capacity, GatewayError, ProcessExit, ProcessHandle, ProcessSpec, Properties,
    SandboxGateway, SandboxInfo, SandboxSpec,
};
use crate::models::PortMapping;

/// Label carrying the sandbox handle, so listing never depends on names.
pub const HANDLE_LABEL: &str = "executor:handle";

const DOCKER_SCHEME: &str = "docker:///";

/// Keeps the container alive between execs.
const KEEP_ALIVE: &str = "trap 'exit 0' TERM; while true; do sleep 3600 & wait $!; done";

pub struct DockerGateway {
    client: Arc<DockerClient>,
    config: DockerConfig,
}

impl DockerGateway {
    pub fn new(config: DockerConfig) -> Self {
        let client = DockerClient::new(&config);
        Self {
            client: Arc::new(client),
            config,
        }
    }

    fn container_name(&self, handle: &str) -> String {
        format!("{}{}", self.config.name_prefix, handle)
    }

    fn image_for(&self, rootfs: &str) -> Result<String, GatewayError> {
        if rootfs.is_empty() {
            return Ok(self.config.default_image.clone());
        }
        match rootfs.strip_prefix(DOCKER_SCHEME) {
            Some(image) if !image.is_empty() => Ok(image.to_string()),
            _ => Err(GatewayError::Runtime(format!("unsupported rootfs: {}", rootfs))),
        }
    }

    fn sandbox_info(handle: &str, inspect: ContainerInspectResponse) -> SandboxInfo {
        let properties = inspect
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default()
            .into_iter()
            .filter(|(key, _)| key != HANDLE_LABEL)
            .collect();

        let mut external_ip = String::new();
        let mut ports = Vec::new();
        if let Some(bindings) = inspect.network_settings.and_then(|n| n.ports) {
            for (key, binding) in bindings {
                let container_port = key
                    .split('/')
                    .next()
                    .and_then(|p| p.parse::<u16>().ok());
                let host = binding.and_then(|b| b.into_iter().next());
                if let (Some(container_port), Some(host)) = (container_port, host) {
                    let host_port = host
                        .host_port
                        .and_then(|p| p.parse::<u16>().ok())
                        .unwrap_or_default();
                    if external_ip.is_empty() {
                        external_ip = host.host_ip.unwrap_or_default();
                    }
                    ports.push(PortMapping {
                        container_port,
                        host_port,
                    });
                }
            }
        }
        ports.sort_by_key(|p| p.container_port);

        if external_ip.is_empty() || external_ip == "0.0.0.0" {
            external_ip = "127.0.0.1".to_string();
        }

        SandboxInfo {
            handle: handle.to_string(),
            external_ip,
            ports,
            properties,
        }
    }
}

fn process_command(process: &ProcessSpec) -> Vec<String> {
    let mut cmd = Vec::with_capacity(process.args.len() + 6);
    if let Some(nofile) = process.nofile {
        cmd.extend([
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("ulimit -n {} && exec \"$0\" \"$@\"", nofile),
        ]);
    }
    cmd.push(process.path.clone());
    cmd.extend(process.args.iter().cloned());
    cmd
}

#[async_trait]
impl SandboxGateway for DockerGateway {
    async fn ping(&self) -> Result<(), GatewayError> {
        self.client.ping().await
    }

    async fn capacity(&self) -> Result<Capacity, GatewayError> {
        Ok(Capacity {
            memory_bytes: self.client.mem_total().await?,
            disk_bytes: self.config.disk_bytes,
            max_containers: self.config.max_containers,
        })
    }

    async fn create(&self, spec: SandboxSpec) -> Result<SandboxInfo, GatewayError> {
        let image = self.image_for(&spec.rootfs)?;
        self.client.ensure_image(&image).await?;

        let mut labels = spec.properties.clone();
        labels.insert(HANDLE_LABEL.to_string(), spec.handle.clone());

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some(self.config.host_ip.clone()),
                    host_port: Some(String::new()),
                }]),
            );
        }

        let memory = (spec.memory_limit_bytes > 0).then_some(spec.memory_limit_bytes as i64);
        let host_config = HostConfig {
            memory,
            memory_swap: memory,
            cpu_shares: (spec.cpu_shares > 0).then_some(spec.cpu_shares as i64),
            port_bindings: Some(port_bindings),
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            env: Some(spec.env.iter().map(|e| format!("{}={}", e.name, e.value)).collect()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            cmd: Some(vec!["/bin/sh".to_string(), "-c".to_string(), KEEP_ALIVE.to_string()]),
            ..Default::default()
        };

        let name = self.container_name(&spec.handle);
        let id = self.client.create_container(&name, config).await?;
        if let Err(e) = self.client.start_container(&id).await {
            warn!("Failed to start container {}: {}", name, e);
            if let Err(e) = self.client.remove_container(&id).await {
                warn!("Failed to clean up container {}: {}", name, e);
            }
            return Err(e);
        }

        let inspect = self.client.inspect_container(&id).await?;
        Ok(Self::sandbox_info(&spec.handle, inspect))
    }

    async fn run(&self, handle: &str, process: ProcessSpec) -> Result<ProcessHandle, GatewayError> {
        let name = self.container_name(handle);
        let env = process.env.iter().map(|e| format!("{}={}", e.name, e.value)).collect();
        let exec_id = self
            .client
            .start_exec(&name, process_command(&process), env, process.dir.clone())
            .await?;

        debug!("Started exec {} in {}", exec_id, name);

        let client = self.client.clone();
        let poll = Duration::from_millis(self.config.exec_poll_interval_ms);
        let id = exec_id.clone();
        let exit = async move {
            loop {
                let inspect = client.inspect_exec(&id).await?;
                if !inspect.running.unwrap_or(false) {
                    let exit_code = inspect.exit_code.unwrap_or(-1);
                    let oom_killed = if exit_code == 137 {
                        client
                            .inspect_container(&name)
                            .await
                            .ok()
                            .and_then(|c| c.state)
                            .and_then(|s| s.oom_killed)
                            .unwrap_or(false)
                    } else {
                        false
                    };
                    return Ok(ProcessExit {
                        exit_code,
                        oom_killed,
                    });
                }
                sleep(poll).await;
            }
        }
        .boxed();

        Ok(ProcessHandle::new(exec_id, exit))
    }

    async fn stop(&self, handle: &str) -> Result<(), GatewayError> {
        let name = self.container_name(handle);
        self.client
            .stop_container(&name, self.config.stop_timeout_secs)
            .await?;
        info!("Stopped container: {}", name);
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<(), GatewayError> {
        self.client.remove_container(&self.container_name(handle)).await
    }

    async fn stream_out(&self, handle: &str, path: &str) -> Result<ByteStream, GatewayError> {
        let name = self.container_name(handle);
        // Surface a missing sandbox before handing back a lazy stream
        self.client.inspect_container(&name).await?;
        self.client.download(&name, path).await
    }

    async fn stream_in(&self, handle: &str, path: &str, tar: Bytes) -> Result<(), GatewayError> {
        self.client.upload(&self.container_name(handle), path, tar).await
    }

    async fn lookup(&self, handle: &str) -> Result<SandboxInfo, GatewayError> {
        let inspect = self.client.inspect_container(&self.container_name(handle)).await?;
        Ok(Self::sandbox_info(handle, inspect))
    }

    async fn list(&self, properties: &Properties) -> Result<Vec<String>, GatewayError> {
        let filters = properties
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let containers = self.client.list_containers(filters).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.labels.and_then(|mut l| l.remove(HANDLE_LABEL)))
            .collect())
    }
}
