pub mod action;
pub mod container;
pub mod event;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use action::{
    Action, DownloadAction, EmitProgressAction, ResourceLimits, RunAction, UploadAction,
};
pub use container::{
    Container, ContainerSpec, ContainerState, EnvironmentVariable, NetworkInfo, PortMapping,
    RunResult, Tags, Transition, MAX_RESULT_BYTES,
};
pub use event::Event;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ExecutorResources {
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub containers: i64,
}

impl ExecutorResources {
    pub fn new(memory_mb: i64, disk_mb: i64, containers: i64) -> Self {
        Self {
            memory_mb,
            disk_mb,
            containers,
        }
    }
}
