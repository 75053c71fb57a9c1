use serde::{Deserialize, Serialize};

use super::container::EnvironmentVariable;

/// Declarative work executed inside a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Run(RunAction),
    Download(DownloadAction),
    Upload(UploadAction),
    EmitProgress(EmitProgressAction),
    Serial { actions: Vec<Action> },
    Parallel { actions: Vec<Action> },
    Timeout { action: Box<Action>, timeout_ms: u64 },
    Try { action: Box<Action> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunAction {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvironmentVariable>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub nofile: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadAction {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub cache_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadAction {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitProgressAction {
    pub action: Box<Action>,
    #[serde(default)]
    pub start_message: String,
    #[serde(default)]
    pub success_message: String,
    #[serde(default)]
    pub failure_message: String,
}

impl Action {
    pub fn run(path: impl Into<String>, args: &[&str]) -> Self {
        Action::Run(RunAction {
            path: path.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn serial(actions: Vec<Action>) -> Self {
        Action::Serial { actions }
    }

    pub fn parallel(actions: Vec<Action>) -> Self {
        Action::Parallel { actions }
    }

    pub fn timeout(action: Action, timeout_ms: u64) -> Self {
        Action::Timeout {
            action: Box::new(action),
            timeout_ms,
        }
    }

    pub fn try_action(action: Action) -> Self {
        Action::Try {
            action: Box::new(action),
        }
    }
}
