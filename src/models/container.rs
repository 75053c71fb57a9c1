use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

use super::action::Action;

pub type Tags = HashMap<String, String>;

/// Largest number of bytes of a result file kept on the run result.
pub const MAX_RESULT_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Reserved,
    Initializing,
    Created,
    Running,
    Completed,
}

/// A requested change to a container's lifecycle state.
///
/// Delete is not listed here: it is legal from every state and removes the
/// record instead of moving it.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Initialize,
    Create(NetworkInfo),
    Run,
    Complete(RunResult),
    Stop,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Initialize => "initialize",
            Transition::Create(_) => "create",
            Transition::Run => "run",
            Transition::Complete(_) => "complete",
            Transition::Stop => "stop",
        }
    }
}

impl ContainerState {
    /// Returns the state reached by applying `transition`, or `None` when the
    /// lifecycle graph has no such edge.
    pub fn apply(&self, transition: &Transition) -> Option<ContainerState> {
        match (self, transition) {
            (ContainerState::Reserved, Transition::Initialize) => Some(ContainerState::Initializing),
            (ContainerState::Initializing, Transition::Create(_)) => Some(ContainerState::Created),
            (ContainerState::Created, Transition::Run) => Some(ContainerState::Running),

            // Every live state can finish, either naturally or by request
            (ContainerState::Completed, Transition::Complete(_)) => None,
            (_, Transition::Complete(_)) => Some(ContainerState::Completed),

            // Stopping something already finished leaves it as it was
            (_, Transition::Stop) => Some(ContainerState::Completed),

            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerState::Completed)
    }

    /// Whether a sandbox is expected to exist for a container in this state.
    pub fn has_sandbox(&self) -> bool {
        matches!(self, ContainerState::Created | ContainerState::Running)
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContainerState::Reserved => "reserved",
            ContainerState::Initializing => "initializing",
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Completed => "completed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RunResult {
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: String,
    #[serde(default)]
    pub stopped: bool,
    #[serde(default)]
    pub result: String,
}

impl RunResult {
    pub fn succeeded(result: String) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failed: true,
            failure_reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn stopped() -> Self {
        Self {
            stopped: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
}

impl EnvironmentVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PortMapping {
    pub container_port: u16,
    #[serde(default)]
    pub host_port: u16,
}

/// Addressing assigned by the runtime once a sandbox exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    pub external_ip: String,
    pub ports: Vec<PortMapping>,
}

/// What a caller submits when allocating a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ContainerSpec {
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub disk_mb: i64,
    #[serde(default)]
    pub cpu_weight: u32,
    #[serde(default)]
    pub rootfs: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub action: Option<Action>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub monitor: Option<Action>,
    #[serde(default)]
    pub env: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub result_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Container {
    pub guid: String,
    pub state: ContainerState,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub cpu_weight: u32,
    pub rootfs: String,
    pub ports: Vec<PortMapping>,
    pub tags: Tags,
    #[schema(value_type = Option<Object>)]
    pub action: Option<Action>,
    #[schema(value_type = Option<Object>)]
    pub monitor: Option<Action>,
    pub env: Vec<EnvironmentVariable>,
    pub result_file: Option<String>,
    #[serde(default)]
    pub external_ip: String,
    pub allocated_at: DateTime<Utc>,
    #[serde(default)]
    pub run_result: RunResult,
}

impl Container {
    pub fn reserved(spec: ContainerSpec) -> Self {
        Self {
            guid: spec.guid,
            state: ContainerState::Reserved,
            memory_mb: spec.memory_mb,
            disk_mb: spec.disk_mb,
            cpu_weight: spec.cpu_weight,
            rootfs: spec.rootfs,
            ports: spec.ports,
            tags: spec.tags,
            action: spec.action,
            monitor: spec.monitor,
            env: spec.env,
            result_file: spec.result_file,
            external_ip: String::new(),
            allocated_at: Utc::now(),
            run_result: RunResult::default(),
        }
    }

    /// AND-match: every filter pair must be present on the container.
    pub fn matches_tags(&self, filter: &Tags) -> bool {
        filter
            .iter()
            .all(|(key, value)| self.tags.get(key) == Some(value))
    }
}
