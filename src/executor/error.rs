use thiserror::Error;

use super::pool::InsufficientResources;
use crate::gateway::GatewayError;
use crate::models::ContainerState;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("guid not specified")]
    GuidNotSpecified,

    #[error("container guid not available")]
    ContainerGuidNotAvailable,

    #[error("container limits invalid")]
    LimitsInvalid,

    #[error("insufficient resources available")]
    InsufficientResourcesAvailable,

    #[error("container not found")]
    ContainerNotFound,

    #[error("cannot {transition} container {guid} in state {from}")]
    InvalidTransition {
        guid: String,
        from: ContainerState,
        transition: &'static str,
    },

    #[error("container not ready")]
    ContainerNotReady,

    #[error("executor shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<InsufficientResources> for ExecutorError {
    fn from(_: InsufficientResources) -> Self {
        ExecutorError::InsufficientResourcesAvailable
    }
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
