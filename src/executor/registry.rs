use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{ExecutorError, ExecutorResult};
use super::hub::EventHub;
use super::pool::{Reservation, ResourcePool};
use crate::models::{
    Container, ContainerSpec, ContainerState, Event, ExecutorResources, RunResult, Tags, Transition,
};

/// Authoritative table of containers and the capacity they hold.
///
/// Records and the pool live behind one lock, and events are published while
/// holding it, so subscribers see each container's transitions in order and
/// resource reads never observe a half-applied change.
pub struct ContainerRegistry {
    inner: Mutex<RegistryState>,
    hub: EventHub,
}

struct RegistryState {
    pool: ResourcePool,
    entries: HashMap<String, Entry>,
}

struct Entry {
    container: Container,
    reservation: Option<Reservation>,
    supervisor: Option<CancellationToken>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    container: Container,
    reserved: bool,
}

/// What `stop` found, so the caller can finish the job outside the lock.
#[derive(Debug)]
pub struct Stopped {
    pub container: Container,
    pub previous: ContainerState,
}

fn validate(spec: &ContainerSpec) -> ExecutorResult<()> {
    if spec.guid.is_empty() {
        return Err(ExecutorError::GuidNotSpecified);
    }
    if spec.cpu_weight > 100 || spec.memory_mb < 0 || spec.disk_mb < 0 {
        return Err(ExecutorError::LimitsInvalid);
    }
    Ok(())
}

impl ContainerRegistry {
    pub fn new(total: ExecutorResources, hub: EventHub) -> Self {
        Self {
            inner: Mutex::new(RegistryState {
                pool: ResourcePool::new(total),
                entries: HashMap::new(),
            }),
            hub,
        }
    }

    /// Reserves every spec independently; the result maps each rejected guid
    /// to its reason.
    pub async fn allocate(&self, specs: Vec<ContainerSpec>) -> HashMap<String, ExecutorError> {
        let mut state = self.inner.lock().await;
        let mut errors = HashMap::new();

        for spec in specs {
            let guid = spec.guid.clone();
            match Self::allocate_one(&mut state, spec) {
                Ok(container) => {
                    info!(guid = %guid, memory_mb = container.memory_mb, disk_mb = container.disk_mb, "Reserved container");
                    self.hub.publish(Event::for_container(&container));
                }
                Err(e) => {
                    debug!(guid = %guid, "Allocation rejected: {}", e);
                    errors.insert(guid, e);
                }
            }
        }

        errors
    }

    fn allocate_one(state: &mut RegistryState, spec: ContainerSpec) -> ExecutorResult<Container> {
        validate(&spec)?;
        if state.entries.contains_key(&spec.guid) {
            return Err(ExecutorError::ContainerGuidNotAvailable);
        }

        let reservation = state.pool.reserve(spec.memory_mb, spec.disk_mb)?;
        let container = Container::reserved(spec);
        state.entries.insert(
            container.guid.clone(),
            Entry {
                container: container.clone(),
                reservation: Some(reservation),
                supervisor: None,
            },
        );
        Ok(container)
    }

    pub async fn get(&self, guid: &str) -> ExecutorResult<Container> {
        let state = self.inner.lock().await;
        state
            .entries
            .get(guid)
            .map(|e| e.container.clone())
            .ok_or(ExecutorError::ContainerNotFound)
    }

    pub async fn list(&self, tags: &Tags) -> Vec<Container> {
        let state = self.inner.lock().await;
        let mut containers: Vec<Container> = state
            .entries
            .values()
            .filter(|e| e.container.matches_tags(tags))
            .map(|e| e.container.clone())
            .collect();
        containers.sort_by(|a, b| a.guid.cmp(&b.guid));
        containers
    }

    /// Moves a reserved container to initializing and records the token that
    /// cancels its supervisor.
    pub async fn begin_run(&self, guid: &str, supervisor: CancellationToken) -> ExecutorResult<Container> {
        let mut state = self.inner.lock().await;
        let entry = state
            .entries
            .get_mut(guid)
            .ok_or(ExecutorError::ContainerNotFound)?;

        let container = self.apply(entry, Transition::Initialize)?;
        entry.supervisor = Some(supervisor);
        Ok(container)
    }

    pub async fn transition(&self, guid: &str, transition: Transition) -> ExecutorResult<Container> {
        let mut state = self.inner.lock().await;
        let entry = state
            .entries
            .get_mut(guid)
            .ok_or(ExecutorError::ContainerNotFound)?;
        self.apply(entry, transition)
    }

    fn apply(&self, entry: &mut Entry, transition: Transition) -> ExecutorResult<Container> {
        let container = &mut entry.container;
        let from = container.state;

        // Stopping a finished container changes nothing and announces nothing
        if from.is_terminal() && matches!(transition, Transition::Stop) {
            return Ok(container.clone());
        }

        let to = from
            .apply(&transition)
            .ok_or_else(|| ExecutorError::InvalidTransition {
                guid: container.guid.clone(),
                from,
                transition: transition.name(),
            })?;

        match transition {
            Transition::Create(network) => {
                container.external_ip = network.external_ip;
                for port in &mut container.ports {
                    if let Some(mapped) = network
                        .ports
                        .iter()
                        .find(|m| m.container_port == port.container_port)
                    {
                        port.host_port = mapped.host_port;
                    }
                }
            }
            Transition::Complete(result) => container.run_result = result,
            Transition::Stop => container.run_result = RunResult::stopped(),
            Transition::Initialize | Transition::Run => {}
        }
        container.state = to;

        if to.is_terminal() {
            entry.supervisor = None;
        }

        info!(guid = %container.guid, from = %from, to = %to, "Container transitioned");
        self.hub.publish(Event::for_container(container));
        Ok(container.clone())
    }

    /// Completes the container as stopped and cancels its supervisor.
    pub async fn stop(&self, guid: &str) -> ExecutorResult<Stopped> {
        let mut state = self.inner.lock().await;
        let entry = state
            .entries
            .get_mut(guid)
            .ok_or(ExecutorError::ContainerNotFound)?;

        let previous = entry.container.state;
        if let Some(token) = entry.supervisor.take() {
            token.cancel();
        }
        let container = self.apply(entry, Transition::Stop)?;
        Ok(Stopped { container, previous })
    }

    /// Removes the record, cancelling its supervisor and returning its
    /// capacity to the pool.
    pub async fn remove(&self, guid: &str) -> ExecutorResult<Container> {
        let mut state = self.inner.lock().await;
        let entry = state
            .entries
            .remove(guid)
            .ok_or(ExecutorError::ContainerNotFound)?;

        if let Some(token) = entry.supervisor {
            token.cancel();
        }
        if let Some(reservation) = entry.reservation {
            state.pool.release(reservation);
        }

        info!(guid = %guid, "Removed container");
        Ok(entry.container)
    }

    /// Completes the container as failed with `reason` and gives its capacity
    /// back right away. The record stays until it is deleted.
    pub async fn fail_and_release(&self, guid: &str, reason: &str) -> ExecutorResult<Container> {
        let mut state = self.inner.lock().await;
        let RegistryState { pool, entries } = &mut *state;
        let entry = entries.get_mut(guid).ok_or(ExecutorError::ContainerNotFound)?;

        if let Some(token) = entry.supervisor.take() {
            token.cancel();
        }
        let container = if entry.container.state.is_terminal() {
            entry.container.clone()
        } else {
            self.apply(entry, Transition::Complete(RunResult::failed(reason)))?
        };
        if let Some(reservation) = entry.reservation.take() {
            pool.release(reservation);
        }
        Ok(container)
    }

    /// Removes reserved containers allocated before `cutoff`.
    pub async fn expire_reserved(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let mut state = self.inner.lock().await;
        let RegistryState { pool, entries } = &mut *state;

        let expired: Vec<String> = entries
            .values()
            .filter(|e| e.container.state == ContainerState::Reserved && e.container.allocated_at < cutoff)
            .map(|e| e.container.guid.clone())
            .collect();

        for guid in &expired {
            if let Some(entry) = entries.remove(guid) {
                if let Some(reservation) = entry.reservation {
                    pool.release(reservation);
                }
                info!(guid = %guid, "Expired reserved container that was never run");
            }
        }

        expired
    }

    /// Guids of containers whose record holds a live supervisor.
    pub async fn supervised(&self) -> Vec<String> {
        let state = self.inner.lock().await;
        state
            .entries
            .values()
            .filter(|e| e.supervisor.is_some())
            .map(|e| e.container.guid.clone())
            .collect()
    }

    pub async fn containers(&self) -> Vec<Container> {
        self.list(&Tags::new()).await
    }

    pub async fn remaining(&self) -> ExecutorResources {
        self.inner.lock().await.pool.remaining()
    }

    pub async fn total(&self) -> ExecutorResources {
        self.inner.lock().await.pool.total()
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let records: Vec<SnapshotRecord> = {
            let state = self.inner.lock().await;
            let mut records: Vec<SnapshotRecord> = state
                .entries
                .values()
                .map(|e| SnapshotRecord {
                    container: e.container.clone(),
                    reserved: e.reservation.is_some(),
                })
                .collect();
            records.sort_by(|a, b| a.container.guid.cmp(&b.container.guid));
            records
        };

        let json = serde_json::to_vec_pretty(&records).context("Failed to serialize snapshot")?;
        let tmp = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;

        debug!("Saved snapshot of {} containers to {}", records.len(), path.display());
        Ok(())
    }

    /// Restores records from a snapshot, re-reserving the capacity they held.
    /// A missing file is an empty snapshot. No events are published.
    pub async fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };
        let records: Vec<SnapshotRecord> =
            serde_json::from_slice(&data).with_context(|| format!("Failed to parse {}", path.display()))?;

        let mut state = self.inner.lock().await;
        let mut restored = 0;
        for record in records {
            let guid = record.container.guid.clone();
            if state.entries.contains_key(&guid) {
                continue;
            }

            let reservation = if record.reserved {
                match state.pool.reserve(record.container.memory_mb, record.container.disk_mb) {
                    Ok(reservation) => Some(reservation),
                    Err(e) => {
                        warn!(guid = %guid, "Could not restore reservation: {}", e);
                        None
                    }
                }
            } else {
                None
            };

            state.entries.insert(
                guid,
                Entry {
                    container: record.container,
                    reservation,
                    supervisor: None,
                },
            );
            restored += 1;
        }

        info!("Restored {} containers from {}", restored, path.display());
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NetworkInfo, PortMapping};

    fn registry() -> (ContainerRegistry, EventHub) {
        let hub = EventHub::new(64);
        (
            ContainerRegistry::new(ExecutorResources::new(1024, 1024, 3), hub.clone()),
            hub,
        )
    }

    fn spec(guid: &str, memory_mb: i64) -> ContainerSpec {
        ContainerSpec {
            guid: guid.to_string(),
            memory_mb,
            disk_mb: memory_mb,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_allocation_errors_are_per_guid() {
        let (registry, _) = registry();
        let mut invalid = spec("invalid", 1);
        invalid.cpu_weight = 101;

        let errors = registry
            .allocate(vec![
                spec("ok", 512),
                spec("", 1),
                invalid,
                spec("too-big", 4096),
            ])
            .await;

        assert_eq!(errors.len(), 3);
        assert_eq!(errors[""], ExecutorError::GuidNotSpecified);
        assert_eq!(errors["invalid"], ExecutorError::LimitsInvalid);
        assert_eq!(errors["too-big"], ExecutorError::InsufficientResourcesAvailable);
        assert_eq!(registry.get("ok").await.unwrap().state, ContainerState::Reserved);
        assert_eq!(registry.remaining().await, ExecutorResources::new(512, 512, 2));
    }

    #[tokio::test]
    async fn test_duplicate_guid_is_rejected() {
        let (registry, _) = registry();
        assert!(registry.allocate(vec![spec("a", 1)]).await.is_empty());
        let errors = registry.allocate(vec![spec("a", 1)]).await;
        assert_eq!(errors["a"], ExecutorError::ContainerGuidNotAvailable);
        assert_eq!(registry.remaining().await, ExecutorResources::new(1023, 1023, 2));
    }

    #[tokio::test]
    async fn test_remove_restores_capacity() {
        let (registry, _) = registry();
        registry.allocate(vec![spec("a", 100), spec("b", 200)]).await;
        registry.remove("a").await.unwrap();
        registry.remove("b").await.unwrap();
        assert_eq!(registry.remaining().await, registry.total().await);
        assert_eq!(registry.remove("a").await.unwrap_err(), ExecutorError::ContainerNotFound);
    }

    #[tokio::test]
    async fn test_transitions_publish_events_in_order() {
        let (registry, hub) = registry();
        let mut events = hub.subscribe();
        let mut with_port = spec("a", 1);
        with_port.ports = vec![PortMapping {
            container_port: 8080,
            host_port: 0,
        }];
        registry.allocate(vec![with_port]).await;
        registry.begin_run("a", CancellationToken::new()).await.unwrap();
        let created = registry
            .transition(
                "a",
                Transition::Create(NetworkInfo {
                    external_ip: "10.0.0.1".into(),
                    ports: vec![PortMapping {
                        container_port: 8080,
                        host_port: 61000,
                    }],
                }),
            )
            .await
            .unwrap();
        assert_eq!(created.external_ip, "10.0.0.1");
        assert_eq!(created.ports[0].host_port, 61000);

        registry.transition("a", Transition::Run).await.unwrap();
        registry
            .transition("a", Transition::Complete(RunResult::succeeded(String::new())))
            .await
            .unwrap();

        let kinds: Vec<&str> = [
            events.next().await.unwrap(),
            events.next().await.unwrap(),
            events.next().await.unwrap(),
            events.next().await.unwrap(),
            events.next().await.unwrap(),
        ]
        .iter()
        .map(|e| e.event_type())
        .collect();
        assert_eq!(kinds, ["reserved", "initializing", "created", "running", "complete"]);
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let (registry, _) = registry();
        registry.allocate(vec![spec("a", 1)]).await;
        let err = registry.transition("a", Transition::Run).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidTransition { from: ContainerState::Reserved, .. }));

        registry.begin_run("a", CancellationToken::new()).await.unwrap();
        assert!(registry.begin_run("a", CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_run_result_written_once() {
        let (registry, _) = registry();
        registry.allocate(vec![spec("a", 1)]).await;
        registry
            .transition("a", Transition::Complete(RunResult::failed("first")))
            .await
            .unwrap();
        assert!(registry
            .transition("a", Transition::Complete(RunResult::failed("second")))
            .await
            .is_err());

        let stopped = registry.stop("a").await.unwrap();
        assert_eq!(stopped.container.run_result.failure_reason, "first");
        assert!(!stopped.container.run_result.stopped);
    }

    #[tokio::test]
    async fn test_stop_cancels_supervisor() {
        let (registry, _) = registry();
        registry.allocate(vec![spec("a", 1)]).await;
        let token = CancellationToken::new();
        registry.begin_run("a", token.clone()).await.unwrap();

        let stopped = registry.stop("a").await.unwrap();
        assert!(token.is_cancelled());
        assert_eq!(stopped.previous, ContainerState::Initializing);
        assert_eq!(stopped.container.state, ContainerState::Completed);
        assert!(stopped.container.run_result.stopped);
        assert!(registry.supervised().await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_and_release_keeps_record() {
        let (registry, _) = registry();
        registry.allocate(vec![spec("a", 100)]).await;
        let container = registry.fail_and_release("a", "sandbox disappeared").await.unwrap();
        assert_eq!(container.run_result.failure_reason, "sandbox disappeared");
        assert_eq!(registry.remaining().await, registry.total().await);

        // Deleting later must not release twice
        registry.remove("a").await.unwrap();
        assert_eq!(registry.remaining().await, registry.total().await);
    }

    #[tokio::test]
    async fn test_expire_reserved() {
        let (registry, _) = registry();
        registry.allocate(vec![spec("old", 10), spec("running", 10)]).await;
        registry.begin_run("running", CancellationToken::new()).await.unwrap();

        let expired = registry.expire_reserved(Utc::now() + chrono::Duration::seconds(1)).await;
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(registry.get("old").await.is_err());
        assert_eq!(registry.remaining().await, ExecutorResources::new(1014, 1014, 2));
    }

    #[tokio::test]
    async fn test_list_filters_by_tags() {
        let (registry, _) = registry();
        let mut tagged = spec("b", 1);
        tagged.tags.insert("app".into(), "web".into());
        registry.allocate(vec![tagged, spec("a", 1)]).await;

        let all: Vec<String> = registry.containers().await.into_iter().map(|c| c.guid).collect();
        assert_eq!(all, vec!["a".to_string(), "b".to_string()]);

        let mut filter = Tags::new();
        filter.insert("app".into(), "web".into());
        let web = registry.list(&filter).await;
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].guid, "b");
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_re_reserves() {
        let dir = std::env::temp_dir().join(format!("cellexec-registry-{}", uuid::Uuid::new_v4()));
        let path = dir.join("snapshot.json");

        let (registry, _) = registry();
        registry.allocate(vec![spec("a", 100), spec("b", 200)]).await;
        registry.fail_and_release("b", "gone").await.unwrap();
        registry.save_snapshot(&path).await.unwrap();

        let (restored, _) = self::registry();
        assert_eq!(restored.load_snapshot(&path).await.unwrap(), 2);
        assert_eq!(restored.remaining().await, ExecutorResources::new(924, 924, 2));
        assert_eq!(
            restored.get("b").await.unwrap().run_result.failure_reason,
            "gone"
        );

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let (registry, _) = registry();
        let path = std::env::temp_dir().join(format!("cellexec-missing-{}.json", uuid::Uuid::new_v4()));
        assert_eq!(registry.load_snapshot(&path).await.unwrap(), 0);
    }
}
