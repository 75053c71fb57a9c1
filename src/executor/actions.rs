use bytes::{Bytes, BytesMut};
use futures::future::{join_all, BoxFuture, FutureExt};
use futures::StreamExt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gateway::{GatewayError, ProcessSpec, SandboxGateway};
use crate::models::{
    Action, DownloadAction, EmitProgressAction, EnvironmentVariable, RunAction, UploadAction,
    MAX_RESULT_BYTES,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct ActionFailure {
    pub reason: String,
}

impl ActionFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

pub type ActionResult = Result<(), ActionFailure>;

/// Where an action tree runs: the sandbox handle and the environment every
/// process in it inherits.
#[derive(Debug, Clone, Default)]
pub struct ActionContext {
    pub handle: String,
    pub env: Vec<EnvironmentVariable>,
}

/// Interprets action trees against a sandbox.
pub struct ActionRunner {
    gateway: Arc<dyn SandboxGateway>,
    http: reqwest::Client,
    cache_dir: PathBuf,
}

impl ActionRunner {
    pub fn new(gateway: Arc<dyn SandboxGateway>, cache_dir: PathBuf) -> Self {
        Self {
            gateway,
            http: reqwest::Client::new(),
            cache_dir,
        }
    }

    pub fn perform<'a>(&'a self, ctx: &'a ActionContext, action: &'a Action) -> BoxFuture<'a, ActionResult> {
        async move {
            match action {
                Action::Run(run) => self.run(ctx, run).await,
                Action::Download(download) => self.download(ctx, download).await,
                Action::Upload(upload) => self.upload(ctx, upload).await,
                Action::EmitProgress(progress) => self.emit_progress(ctx, progress).await,
                Action::Serial { actions } => {
                    for action in actions {
                        self.perform(ctx, action).await?;
                    }
                    Ok(())
                }
                Action::Parallel { actions } => {
                    let results = join_all(actions.iter().map(|a| self.perform(ctx, a))).await;
                    let reasons: Vec<String> = results
                        .into_iter()
                        .filter_map(|r| r.err().map(|f| f.reason))
                        .collect();
                    if reasons.is_empty() {
                        Ok(())
                    } else {
                        Err(ActionFailure::new(reasons.join("; ")))
                    }
                }
                Action::Timeout { action, timeout_ms } => {
                    match tokio::time::timeout(Duration::from_millis(*timeout_ms), self.perform(ctx, action)).await {
                        Ok(result) => result,
                        Err(_) => Err(ActionFailure::new(format!("exceeded {}ms timeout", timeout_ms))),
                    }
                }
                Action::Try { action } => {
                    if let Err(failure) = self.perform(ctx, action).await {
                        info!(handle = %ctx.handle, "Ignoring failed action: {}", failure);
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    async fn run(&self, ctx: &ActionContext, run: &RunAction) -> ActionResult {
        let mut env = ctx.env.clone();
        env.extend(run.env.iter().cloned());

        let process = ProcessSpec {
            path: run.path.clone(),
            args: run.args.clone(),
            env,
            dir: run.dir.clone(),
            nofile: run.resource_limits.nofile,
        };

        debug!(handle = %ctx.handle, path = %run.path, "Running process");
        let exit = self
            .gateway
            .run(&ctx.handle, process)
            .await
            .map_err(|e| ActionFailure::new(format!("failed to run {}: {}", run.path, e)))?
            .wait()
            .await
            .map_err(|e| ActionFailure::new(format!("lost process {}: {}", run.path, e)))?;

        match (exit.exit_code, exit.oom_killed) {
            (0, _) => Ok(()),
            (code, true) => Err(ActionFailure::new(format!("Exited with status {} (out of memory)", code))),
            (code, false) => Err(ActionFailure::new(format!("Exited with status {}", code))),
        }
    }

    async fn download(&self, ctx: &ActionContext, download: &DownloadAction) -> ActionResult {
        let failed = |e: String| ActionFailure::new(format!("failed to download {}: {}", download.from, e));

        let cached = download.cache_key.as_deref().map(|key| self.cache_path(key));
        let archive = match &cached {
            Some(path) if path.exists() => {
                debug!(key = ?download.cache_key, "Download cache hit");
                Bytes::from(tokio::fs::read(path).await.map_err(|e| failed(e.to_string()))?)
            }
            _ => {
                let response = self
                    .http
                    .get(&download.from)
                    .send()
                    .await
                    .map_err(|e| failed(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(failed(format!("status {}", response.status())));
                }
                let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;

                if let Some(path) = &cached {
                    if let Err(e) = tokio::fs::write(path, &body).await {
                        warn!("Failed to cache {}: {}", download.from, e);
                    }
                }
                body
            }
        };

        self.gateway
            .stream_in(&ctx.handle, &download.to, archive)
            .await
            .map_err(|e| failed(e.to_string()))
    }

    async fn upload(&self, ctx: &ActionContext, upload: &UploadAction) -> ActionResult {
        let failed = |e: String| ActionFailure::new(format!("failed to upload to {}: {}", upload.to, e));

        let archive = collect(&*self.gateway, &ctx.handle, &upload.from)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let response = self
            .http
            .post(&upload.to)
            .body(archive)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("status {}", response.status())));
        }
        Ok(())
    }

    async fn emit_progress(&self, ctx: &ActionContext, progress: &EmitProgressAction) -> ActionResult {
        if !progress.start_message.is_empty() {
            info!(handle = %ctx.handle, "{}", progress.start_message);
        }

        match self.perform(ctx, &progress.action).await {
            Ok(()) => {
                if !progress.success_message.is_empty() {
                    info!(handle = %ctx.handle, "{}", progress.success_message);
                }
                Ok(())
            }
            Err(failure) if progress.failure_message.is_empty() => Err(failure),
            Err(failure) => {
                info!(handle = %ctx.handle, "{}", progress.failure_message);
                Err(ActionFailure::new(format!("{}: {}", progress.failure_message, failure.reason)))
            }
        }
    }

    fn cache_path(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.cache_dir.join(name)
    }
}

async fn collect(gateway: &dyn SandboxGateway, handle: &str, path: &str) -> Result<Bytes, GatewayError> {
    let mut stream = gateway.stream_out(handle, path).await?;
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Reads the first file of the tar stream at `path`, keeping at most
/// [`MAX_RESULT_BYTES`].
pub async fn read_result_file(gateway: &dyn SandboxGateway, handle: &str, path: &str) -> Result<String, GatewayError> {
    let archive = collect(gateway, handle, path).await?;
    let invalid = |e: std::io::Error| GatewayError::Runtime(format!("invalid result archive: {e}"));

    let mut archive = tar::Archive::new(archive.as_ref());
    for entry in archive.entries().map_err(invalid)? {
        let entry = entry.map_err(invalid)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut contents = Vec::new();
        entry
            .take(MAX_RESULT_BYTES as u64)
            .read_to_end(&mut contents)
            .map_err(invalid)?;
        return Ok(String::from_utf8_lossy(&contents).into_owned());
    }

    Err(GatewayError::Runtime(format!("no file at {}", path)))
}
