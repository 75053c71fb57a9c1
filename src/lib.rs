//! Node-local executor for sandboxed containers.
//!
//! [`Executor`] admits containers against finite capacity, drives each one
//! through its lifecycle inside a sandbox reached through
//! [`gateway::SandboxGateway`], broadcasts every transition and reconciles
//! its records against the runtime after crashes.

pub mod client;
pub mod config;
pub mod docker;
pub mod executor;
pub mod gateway;
pub mod models;
pub mod server;
pub mod shared;

pub use config::ExecutorConfig;
pub use executor::{Executor, ExecutorError};
