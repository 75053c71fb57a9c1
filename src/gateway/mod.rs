//! Boundary between the executor and the sandbox runtime.
//!
//! The executor never talks to a runtime directly; it goes through
//! [`SandboxGateway`], addressed by handle (the container guid). Two
//! implementations exist: [`crate::docker::DockerGateway`] for real hosts and
//! [`InMemoryGateway`] for development and tests.

mod memory;

pub use memory::InMemoryGateway;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{EnvironmentVariable, PortMapping};

/// Property marking sandboxes created by a given executor instance.
pub const OWNER_PROPERTY: &str = "executor:owner";

pub type Properties = HashMap<String, String>;

pub type ByteStream = BoxStream<'static, Result<Bytes, GatewayError>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox runtime error: {0}")]
    Runtime(String),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacity {
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub max_containers: u64,
}

/// Everything the runtime needs to materialise a sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    pub handle: String,
    pub rootfs: String,
    pub properties: Properties,
    /// Hard memory ceiling; 0 leaves the sandbox unlimited.
    pub memory_limit_bytes: u64,
    pub disk_limit_bytes: u64,
    pub cpu_shares: u64,
    pub ports: Vec<u16>,
    pub env: Vec<EnvironmentVariable>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxInfo {
    pub handle: String,
    pub external_ip: String,
    pub ports: Vec<PortMapping>,
    pub properties: Properties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<EnvironmentVariable>,
    pub dir: Option<String>,
    pub nofile: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub exit_code: i64,
    pub oom_killed: bool,
}

impl ProcessExit {
    pub fn code(exit_code: i64) -> Self {
        Self {
            exit_code,
            oom_killed: false,
        }
    }
}

/// A process launched inside a sandbox.
pub struct ProcessHandle {
    pub id: String,
    exit: BoxFuture<'static, Result<ProcessExit, GatewayError>>,
}

impl ProcessHandle {
    pub fn new(id: impl Into<String>, exit: BoxFuture<'static, Result<ProcessExit, GatewayError>>) -> Self {
        Self { id: id.into(), exit }
    }

    pub async fn wait(self) -> Result<ProcessExit, GatewayError> {
        self.exit.await
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("id", &self.id).finish()
    }
}

#[async_trait]
pub trait SandboxGateway: Send + Sync {
    async fn ping(&self) -> Result<(), GatewayError>;

    async fn capacity(&self) -> Result<Capacity, GatewayError>;

    async fn create(&self, spec: SandboxSpec) -> Result<SandboxInfo, GatewayError>;

    async fn run(&self, handle: &str, process: ProcessSpec) -> Result<ProcessHandle, GatewayError>;

    /// Kills every process in the sandbox but keeps the sandbox itself.
    async fn stop(&self, handle: &str) -> Result<(), GatewayError>;

    async fn destroy(&self, handle: &str) -> Result<(), GatewayError>;

    /// Tar stream of the file or directory at `path`.
    async fn stream_out(&self, handle: &str, path: &str) -> Result<ByteStream, GatewayError>;

    /// Extracts the tar archive `tar` at `path`.
    async fn stream_in(&self, handle: &str, path: &str, tar: Bytes) -> Result<(), GatewayError>;

    async fn lookup(&self, handle: &str) -> Result<SandboxInfo, GatewayError>;

    /// Handles of sandboxes carrying all of `properties`.
    async fn list(&self, properties: &Properties) -> Result<Vec<String>, GatewayError>;
}
