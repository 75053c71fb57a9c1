//! The node-local executor: admission, lifecycle, supervision and recovery
//! of sandboxed containers.

pub mod actions;
pub mod error;
pub mod hub;
pub mod pool;
pub mod reconcile;
pub mod registry;
pub mod supervisor;

pub use error::{ExecutorError, ExecutorResult};
pub use hub::{EventHub, EventSubscription};

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ExecutorConfig;
use crate::gateway::{ByteStream, GatewayError, SandboxGateway};
use crate::models::{Container, ContainerSpec, ContainerState, ExecutorResources, Tags};
use actions::ActionRunner;
use reconcile::{reset_cache_dir, wait_for_gateway, Reconciler};
use registry::ContainerRegistry;
use supervisor::{Supervisor, SupervisorSettings};

const MB: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    registry: Arc<ContainerRegistry>,
    hub: EventHub,
    gateway: Arc<dyn SandboxGateway>,
    supervisor: Supervisor,
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
}

impl Executor {
    /// Boots an executor: resets the download cache, waits for the sandbox
    /// runtime, recovers state left by a previous process and starts the
    /// pruning loop. Cancelling `shutdown` stops everything it started.
    pub async fn start(
        config: &ExecutorConfig,
        gateway: Arc<dyn SandboxGateway>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        reset_cache_dir(&config.cache_path).await?;

        info!("Waiting for sandbox runtime...");
        if !wait_for_gateway(&*gateway, config.gateway_retry_interval(), &shutdown).await {
            anyhow::bail!("shut down before the sandbox runtime became available");
        }

        let capacity = gateway
            .capacity()
            .await
            .context("Failed to read sandbox runtime capacity")?;
        let total = ExecutorResources::new(
            config.memory_mb.unwrap_or((capacity.memory_bytes / MB) as i64),
            config.disk_mb.unwrap_or((capacity.disk_bytes / MB) as i64),
            config.max_containers.unwrap_or(capacity.max_containers as i64),
        );
        info!(
            memory_mb = total.memory_mb,
            disk_mb = total.disk_mb,
            containers = total.containers,
            "Executor capacity"
        );

        let hub = EventHub::new(config.event_buffer_size);
        let registry = Arc::new(ContainerRegistry::new(total, hub.clone()));
        let settings = Arc::new(SupervisorSettings::from(config));
        let runner = Arc::new(ActionRunner::new(gateway.clone(), config.cache_path.clone()));

        let reconciler = Arc::new(Reconciler::new(
            registry.clone(),
            gateway.clone(),
            settings.owner_properties(),
            config.reserved_container_ttl(),
            config.snapshot_path.clone(),
        ));
        reconciler
            .recover()
            .await
            .context("Failed to recover executor state")?;

        tokio::spawn(
            reconciler
                .clone()
                .run(config.prune_interval(), shutdown.child_token()),
        );

        let supervisor = Supervisor {
            registry: registry.clone(),
            gateway: gateway.clone(),
            runner,
            settings,
        };

        info!("Executor started");
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                registry,
                hub,
                gateway,
                supervisor,
                reconciler,
                shutdown,
            }),
        })
    }

    /// Reserves capacity for each spec. Returns the guids that could not be
    /// allocated with the reason; the others are now `reserved`.
    pub async fn allocate_containers(&self, specs: Vec<ContainerSpec>) -> HashMap<String, ExecutorError> {
        self.inner.registry.allocate(specs).await
    }

    pub async fn get_container(&self, guid: &str) -> ExecutorResult<Container> {
        self.inner.registry.get(guid).await
    }

    pub async fn list_containers(&self, tags: &Tags) -> Vec<Container> {
        self.inner.registry.list(tags).await
    }

    /// Starts supervising a reserved container. Returns once the container
    /// is `initializing`; everything after happens in the background.
    /// Refused once shutdown has begun, leaving the container `reserved`.
    pub async fn run_container(&self, guid: &str) -> ExecutorResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ExecutorError::ShuttingDown);
        }
        let token = self.inner.shutdown.child_token();
        let container = self.inner.registry.begin_run(guid, token.clone()).await?;

        tokio::spawn(self.inner.supervisor.clone().supervise(container, token));
        Ok(())
    }

    /// Completes the container as stopped. Its sandbox is kept until the
    /// container is deleted.
    pub async fn stop_container(&self, guid: &str) -> ExecutorResult<()> {
        let stopped = self.inner.registry.stop(guid).await?;

        let may_have_sandbox = matches!(
            stopped.previous,
            ContainerState::Initializing | ContainerState::Created | ContainerState::Running
        );
        if may_have_sandbox {
            match self.inner.gateway.stop(guid).await {
                Ok(()) | Err(GatewayError::NotFound(_)) => {}
                Err(e) => warn!(guid = %guid, "Failed to stop sandbox: {}", e),
            }
        }

        info!(guid = %guid, "Stopped container");
        Ok(())
    }

    pub async fn delete_container(&self, guid: &str) -> ExecutorResult<()> {
        self.inner.registry.remove(guid).await?;

        match self.inner.gateway.destroy(guid).await {
            Ok(()) | Err(GatewayError::NotFound(_)) => {}
            // The pruner destroys it once the runtime answers again
            Err(e) => warn!(guid = %guid, "Failed to destroy sandbox: {}", e),
        }
        Ok(())
    }

    pub async fn remaining_resources(&self) -> ExecutorResources {
        self.inner.registry.remaining().await
    }

    pub async fn total_resources(&self) -> ExecutorResources {
        self.inner.registry.total().await
    }

    pub fn subscribe_to_events(&self) -> EventSubscription {
        self.inner.hub.subscribe()
    }

    pub async fn ping(&self) -> ExecutorResult<()> {
        Ok(self.inner.gateway.ping().await?)
    }

    /// Tar stream of `path` inside the container's sandbox.
    pub async fn get_files(&self, guid: &str, path: &str) -> ExecutorResult<ByteStream> {
        let container = self.inner.registry.get(guid).await?;
        if matches!(container.state, ContainerState::Reserved | ContainerState::Initializing) {
            return Err(ExecutorError::ContainerNotReady);
        }
        Ok(self.inner.gateway.stream_out(guid, path).await?)
    }

    /// Cancels supervisors and the pruning loop, persists the snapshot and
    /// ends every event subscription. Sandboxes are left for the next start.
    pub async fn shutdown(&self) {
        info!("Shutting down executor");
        self.inner.shutdown.cancel();

        if let Err(e) = self.inner.reconciler.save_snapshot().await {
            error!("Failed to save snapshot: {:#}", e);
        }
        self.inner.hub.close();
    }
}
