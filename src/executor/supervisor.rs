use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::actions::{read_result_file, ActionContext, ActionResult, ActionRunner};
use super::registry::ContainerRegistry;
use crate::config::ExecutorConfig;
use crate::gateway::{GatewayError, Properties, SandboxGateway, SandboxInfo, SandboxSpec, OWNER_PROPERTY};
use crate::models::{Container, EnvironmentVariable, NetworkInfo, PortMapping, RunResult, Transition};

const MB: u64 = 1024 * 1024;

pub const FAILED_TO_INITIALIZE: &str = "failed to initialize container";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub owner_name: String,
    pub container_max_cpu_shares: u64,
    pub healthy_interval: Duration,
    pub unhealthy_interval: Duration,
    pub monitor_failure_threshold: u32,
    pub export_network_env_vars: bool,
}

impl From<&ExecutorConfig> for SupervisorSettings {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            owner_name: config.owner_name.clone(),
            container_max_cpu_shares: config.container_max_cpu_shares,
            healthy_interval: config.healthy_monitoring_interval(),
            unhealthy_interval: config.unhealthy_monitoring_interval(),
            monitor_failure_threshold: config.monitor_failure_threshold.max(1),
            export_network_env_vars: config.export_network_env_vars,
        }
    }
}

impl SupervisorSettings {
    pub fn owner_properties(&self) -> Properties {
        let mut properties = Properties::new();
        properties.insert(OWNER_PROPERTY.to_string(), self.owner_name.clone());
        properties
    }
}

/// Drives one container from initializing to completed.
#[derive(Clone)]
pub struct Supervisor {
    pub(super) registry: Arc<ContainerRegistry>,
    pub(super) gateway: Arc<dyn SandboxGateway>,
    pub(super) runner: Arc<ActionRunner>,
    pub(super) settings: Arc<SupervisorSettings>,
}

impl Supervisor {
    /// Runs until the container completes or `cancel` fires. Cancellation
    /// leaves the registry untouched; whoever cancelled owns the record.
    pub async fn supervise(self, container: Container, cancel: CancellationToken) {
        let guid = container.guid.clone();
        if cancel.is_cancelled() {
            debug!(guid = %guid, "Supervisor cancelled before start");
            return;
        }

        // Creation is not interrupted: a sandbox the runtime already made
        // must be seen here to be cleaned up
        let Some(sandbox) = self.initialize(&container, &cancel).await else {
            return;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(guid = %guid, "Supervisor cancelled");
            }
            _ = self.drive(container, sandbox) => {
                debug!(guid = %guid, "Supervisor finished");
            }
        }
    }

    fn sandbox_spec(&self, container: &Container) -> SandboxSpec {
        SandboxSpec {
            handle: container.guid.clone(),
            rootfs: container.rootfs.clone(),
            properties: self.settings.owner_properties(),
            memory_limit_bytes: container.memory_mb.max(0) as u64 * MB,
            disk_limit_bytes: container.disk_mb.max(0) as u64 * MB,
            cpu_shares: cpu_shares(container.cpu_weight, self.settings.container_max_cpu_shares),
            ports: container.ports.iter().map(|p| p.container_port).collect(),
            env: container.env.clone(),
        }
    }

    /// Creates the sandbox and moves the container to `created`. Returns
    /// `None` when there is nothing left to supervise.
    async fn initialize(&self, container: &Container, cancel: &CancellationToken) -> Option<SandboxInfo> {
        let guid = &container.guid;

        let sandbox = match self.gateway.create(self.sandbox_spec(container)).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                warn!(guid = %guid, "Failed to create sandbox: {}", e);
                self.complete(guid, RunResult::failed(FAILED_TO_INITIALIZE)).await;
                return None;
            }
        };

        if cancel.is_cancelled() {
            self.abandon_sandbox(guid).await;
            return None;
        }

        let network = NetworkInfo {
            external_ip: sandbox.external_ip.clone(),
            ports: sandbox.ports.clone(),
        };
        if let Err(e) = self.registry.transition(guid, Transition::Create(network)).await {
            debug!(guid = %guid, "Container moved on before creation: {}", e);
            self.abandon_sandbox(guid).await;
            return None;
        }

        Some(sandbox)
    }

    /// Cleans up a sandbox whose container changed underneath creation:
    /// deleted containers lose it, stopped ones keep it stopped. A record
    /// still live (executor shutting down) is left for recovery.
    async fn abandon_sandbox(&self, guid: &str) {
        let result = match self.registry.get(guid).await {
            Err(_) => {
                info!(guid = %guid, "Destroying sandbox of deleted container");
                self.gateway.destroy(guid).await
            }
            Ok(container) if container.state.is_terminal() => self.gateway.stop(guid).await,
            Ok(_) => Ok(()),
        };
        match result {
            Ok(()) | Err(GatewayError::NotFound(_)) => {}
            Err(e) => warn!(guid = %guid, "Failed to clean up sandbox: {}", e),
        }
    }

    async fn drive(&self, container: Container, sandbox: SandboxInfo) {
        let guid = container.guid.clone();

        let mut env = container.env.clone();
        if self.settings.export_network_env_vars {
            env.extend(network_env(&sandbox));
        }
        let ctx = ActionContext {
            handle: guid.clone(),
            env,
        };

        if container.monitor.is_none() {
            if let Err(e) = self.registry.transition(&guid, Transition::Run).await {
                debug!(guid = %guid, "Container moved on before running: {}", e);
                return;
            }
        }

        let action: BoxFuture<'_, ActionResult> = match &container.action {
            Some(action) => self.runner.perform(&ctx, action),
            None => future::ready(Ok(())).boxed(),
        };
        let mut action = action.fuse();
        let mut action_done = false;
        let mut healthy = false;
        let mut failures = 0u32;

        loop {
            let interval = if healthy {
                self.settings.healthy_interval
            } else {
                self.settings.unhealthy_interval
            };
            let monitor_check = async {
                match &container.monitor {
                    Some(monitor) => {
                        tokio::time::sleep(interval).await;
                        self.runner.perform(&ctx, monitor).await
                    }
                    None => future::pending().await,
                }
            };

            tokio::select! {
                result = &mut action, if !action_done => {
                    action_done = true;
                    match result {
                        Err(failure) => {
                            info!(guid = %guid, "Action failed: {}", failure);
                            self.complete(&guid, RunResult::failed(failure.reason)).await;
                            return;
                        }
                        Ok(()) if container.monitor.is_none() => {
                            let result = self.collect_result(&container).await;
                            self.complete(&guid, result).await;
                            return;
                        }
                        Ok(()) => {
                            debug!(guid = %guid, "Action exited cleanly, monitoring continues");
                        }
                    }
                }
                check = monitor_check => match check {
                    Ok(()) => {
                        failures = 0;
                        if !healthy {
                            healthy = true;
                            if let Err(e) = self.registry.transition(&guid, Transition::Run).await {
                                debug!(guid = %guid, "Container moved on before healthy: {}", e);
                                return;
                            }
                        }
                    }
                    Err(failure) if healthy => {
                        failures += 1;
                        debug!(guid = %guid, failures, "Monitor failed: {}", failure);
                        if failures >= self.settings.monitor_failure_threshold {
                            info!(guid = %guid, "Container became unhealthy");
                            self.complete(&guid, RunResult::failed(format!("monitor failed: {}", failure.reason))).await;
                            return;
                        }
                    }
                    Err(failure) => {
                        debug!(guid = %guid, "Not healthy yet: {}", failure);
                    }
                },
            }
        }
    }

    async fn collect_result(&self, container: &Container) -> RunResult {
        let Some(path) = &container.result_file else {
            return RunResult::succeeded(String::new());
        };

        match read_result_file(&*self.gateway, &container.guid, path).await {
            Ok(result) => RunResult::succeeded(result),
            Err(e) => {
                warn!(guid = %container.guid, "Failed to read result file {}: {}", path, e);
                RunResult::failed(format!("failed to read result file: {}", e))
            }
        }
    }

    async fn complete(&self, guid: &str, result: RunResult) {
        if let Err(e) = self.registry.transition(guid, Transition::Complete(result)).await {
            debug!(guid = %guid, "Could not complete container: {}", e);
        }
    }
}

pub fn cpu_shares(cpu_weight: u32, max_cpu_shares: u64) -> u64 {
    u64::from(cpu_weight.min(100)) * max_cpu_shares / 100
}

/// Addressing variables exported to processes when enabled.
pub fn network_env(sandbox: &SandboxInfo) -> Vec<EnvironmentVariable> {
    let mut env = vec![EnvironmentVariable::new("INSTANCE_IP", &sandbox.external_ip)];

    if let Some(first) = sandbox.ports.first() {
        env.push(EnvironmentVariable::new("INSTANCE_PORT", first.host_port.to_string()));
        env.push(EnvironmentVariable::new(
            "INSTANCE_ADDR",
            format!("{}:{}", sandbox.external_ip, first.host_port),
        ));
    } else {
        env.push(EnvironmentVariable::new("INSTANCE_PORT", ""));
        env.push(EnvironmentVariable::new("INSTANCE_ADDR", ""));
    }

    let ports: Vec<serde_json::Value> = sandbox
        .ports
        .iter()
        .map(|PortMapping { container_port, host_port }| {
            serde_json::json!({ "external": host_port, "internal": container_port })
        })
        .collect();
    env.push(EnvironmentVariable::new(
        "INSTANCE_PORTS",
        serde_json::Value::Array(ports).to_string(),
    ));

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_shares_scale_with_weight() {
        assert_eq!(cpu_shares(0, 1024), 0);
        assert_eq!(cpu_shares(50, 1024), 512);
        assert_eq!(cpu_shares(100, 1024), 1024);
    }

    #[test]
    fn test_network_env() {
        let sandbox = SandboxInfo {
            handle: "h".into(),
            external_ip: "10.0.0.5".into(),
            ports: vec![
                PortMapping {
                    container_port: 8080,
                    host_port: 61000,
                },
                PortMapping {
                    container_port: 2222,
                    host_port: 61001,
                },
            ],
            properties: Properties::new(),
        };

        let env = network_env(&sandbox);
        let get = |name: &str| env.iter().find(|e| e.name == name).map(|e| e.value.clone());
        assert_eq!(get("INSTANCE_IP").as_deref(), Some("10.0.0.5"));
        assert_eq!(get("INSTANCE_PORT").as_deref(), Some("61000"));
        assert_eq!(get("INSTANCE_ADDR").as_deref(), Some("10.0.0.5:61000"));
        assert_eq!(
            get("INSTANCE_PORTS").as_deref(),
            Some(r#"[{"external":61000,"internal":8080},{"external":61001,"internal":2222}]"#)
        );
    }

    #[test]
    fn test_owner_properties() {
        let settings = SupervisorSettings::from(&ExecutorConfig::default());
        let properties = settings.owner_properties();
        assert_eq!(properties.get(OWNER_PROPERTY).map(String::as_str), Some("executor"));
    }
}
