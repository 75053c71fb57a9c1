use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::ExecutorError;
use super::registry::ContainerRegistry;
use crate::gateway::{GatewayError, Properties, SandboxGateway};
use crate::models::{ContainerState, RunResult, Transition};

pub const SANDBOX_DISAPPEARED: &str = "sandbox disappeared";
pub const EXECUTOR_RESTARTED: &str = "executor restarted";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub destroyed: Vec<String>,
    pub vanished: Vec<String>,
    pub restarted: Vec<String>,
    pub expired: Vec<String>,
}

/// Keeps the registry and the sandbox runtime in agreement.
pub struct Reconciler {
    registry: Arc<ContainerRegistry>,
    gateway: Arc<dyn SandboxGateway>,
    owner_properties: Properties,
    reserved_ttl: Duration,
    snapshot_path: Option<PathBuf>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ContainerRegistry>,
        gateway: Arc<dyn SandboxGateway>,
        owner_properties: Properties,
        reserved_ttl: Duration,
        snapshot_path: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            gateway,
            owner_properties,
            reserved_ttl,
            snapshot_path,
        }
    }

    /// Startup pass: restore the snapshot, then settle every record and
    /// sandbox left behind by a previous process.
    pub async fn recover(&self) -> Result<ReconcileReport> {
        if let Some(path) = &self.snapshot_path {
            self.registry.load_snapshot(path).await?;
        }

        let mut report = ReconcileReport::default();
        let sandboxes = self.owned_sandboxes().await?;
        self.destroy_orphans(&sandboxes, &mut report).await;

        // Nothing supervises restored records, so anything mid-flight is over
        for container in self.registry.containers().await {
            let live = matches!(
                container.state,
                ContainerState::Initializing | ContainerState::Created | ContainerState::Running
            );
            if !live {
                continue;
            }

            if sandboxes.contains(&container.guid) {
                let result = RunResult::failed(EXECUTOR_RESTARTED);
                match self.registry.transition(&container.guid, Transition::Complete(result)).await {
                    Ok(_) => report.restarted.push(container.guid),
                    Err(e) => debug!(guid = %container.guid, "Skipping restarted container: {}", e),
                }
            } else {
                self.registry
                    .fail_and_release(&container.guid, SANDBOX_DISAPPEARED)
                    .await?;
                report.vanished.push(container.guid);
            }
        }

        info!(
            destroyed = report.destroyed.len(),
            vanished = report.vanished.len(),
            restarted = report.restarted.len(),
            "Recovered executor state"
        );
        Ok(report)
    }

    /// Periodic pass: destroy orphaned sandboxes, fail containers whose
    /// sandbox vanished and expire reservations nobody ran.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let sandboxes = self.owned_sandboxes().await?;
        self.destroy_orphans(&sandboxes, &mut report).await;

        for container in self.registry.containers().await {
            if !container.state.has_sandbox() || sandboxes.contains(&container.guid) {
                continue;
            }

            // The listing may predate a sandbox created since; ask directly
            match self.gateway.lookup(&container.guid).await {
                Ok(_) => continue,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e).context("Failed to look up sandbox"),
            }

            match self
                .registry
                .fail_and_release(&container.guid, SANDBOX_DISAPPEARED)
                .await
            {
                Ok(_) => {
                    warn!(guid = %container.guid, "Sandbox disappeared");
                    report.vanished.push(container.guid);
                }
                Err(ExecutorError::ContainerNotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let ttl = chrono::Duration::from_std(self.reserved_ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now().checked_sub_signed(ttl).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        report.expired = self.registry.expire_reserved(cutoff).await;

        Ok(report)
    }

    async fn owned_sandboxes(&self) -> Result<HashSet<String>> {
        let handles = self
            .gateway
            .list(&self.owner_properties)
            .await
            .context("Failed to list sandboxes")?;
        Ok(handles.into_iter().collect())
    }

    async fn destroy_orphans(&self, sandboxes: &HashSet<String>, report: &mut ReconcileReport) {
        for handle in sandboxes {
            if self.registry.get(handle).await.is_ok() {
                continue;
            }

            match self.gateway.destroy(handle).await {
                Ok(()) | Err(GatewayError::NotFound(_)) => {
                    info!(handle = %handle, "Destroyed orphaned sandbox");
                    report.destroyed.push(handle.clone());
                }
                Err(e) => warn!(handle = %handle, "Failed to destroy orphaned sandbox: {}", e),
            }
        }
    }

    pub async fn save_snapshot(&self) -> Result<()> {
        match &self.snapshot_path {
            Some(path) => self.registry.save_snapshot(path).await,
            None => Ok(()),
        }
    }

    /// Reconciles every `period` until `cancel` fires. Failures are logged
    /// and retried on the next tick.
    pub async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Pruning loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.reconcile().await {
                Ok(report) if report != ReconcileReport::default() => {
                    info!(
                        destroyed = report.destroyed.len(),
                        vanished = report.vanished.len(),
                        expired = report.expired.len(),
                        "Pruned executor state"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("Pruning failed: {:#}", e),
            }

            if let Err(e) = self.save_snapshot().await {
                error!("Failed to save snapshot: {:#}", e);
            }
        }
    }
}

/// Empties `path`, creating it if needed.
pub async fn reset_cache_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to clear {}", path.display())),
    }
    tokio::fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))
}

/// Blocks until the gateway answers a ping, retrying every `retry`.
/// Returns false if `cancel` fires first.
pub async fn wait_for_gateway(gateway: &dyn SandboxGateway, retry: Duration, cancel: &CancellationToken) -> bool {
    loop {
        match gateway.ping().await {
            Ok(()) => return true,
            Err(e) => warn!("Sandbox runtime not ready, retrying in {:?}: {}", retry, e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}
