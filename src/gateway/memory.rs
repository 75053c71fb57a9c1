//! In-process sandbox runtime.
//!
//! Sandboxes are plain records with an in-memory file system. Processes are
//! interpreted from a small command vocabulary instead of being executed:
//!
//! | path     | behaviour                                                        |
//! |----------|------------------------------------------------------------------|
//! | `true`   | exits 0                                                          |
//! | `false`  | exits 1                                                          |
//! | `exit N` | exits N                                                          |
//! | `sleep S`| sleeps S seconds (fractional allowed), exits 0                   |
//! | `hang`   | never exits on its own                                           |
//! | `oom`    | allocates without bound: OOM-killed under a memory limit         |
//! | `touch F`| creates empty file F                                             |
//! | `write F C` | writes C to file F                                            |
//! | `once F` | exits 0 and creates F if F is absent, otherwise exits 1          |
//! | `nofile N` | opens N descriptors: exits 2 when the process limit is lower   |
//!
//! Anything else exits 127. Every process is killed (exit 137) when its
//! sandbox is stopped or destroyed.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, FutureExt};
use futures::stream;
use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{
    ByteStream, Capacity, GatewayError, ProcessExit, ProcessHandle, ProcessSpec, Properties,
    SandboxGateway, SandboxInfo, SandboxSpec,
};
use crate::models::PortMapping;

const EXTERNAL_IP: &str = "127.0.0.1";
const FIRST_HOST_PORT: u16 = 61000;

#[derive(Clone)]
pub struct InMemoryGateway {
    inner: Arc<Mutex<MemoryState>>,
}

struct MemoryState {
    capacity: Capacity,
    available: bool,
    fail_creates: bool,
    next_host_port: u16,
    sandboxes: HashMap<String, MemorySandbox>,
}

struct MemorySandbox {
    info: SandboxInfo,
    memory_limit_bytes: u64,
    cpu_shares: u64,
    env: Vec<crate::models::EnvironmentVariable>,
    files: HashMap<String, Vec<u8>>,
    processes: Vec<ProcessSpec>,
    stopped: bool,
    kill: CancellationToken,
}

impl InMemoryGateway {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                capacity,
                available: true,
                fail_creates: false,
                next_host_port: FIRST_HOST_PORT,
                sandboxes: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_available(&self) -> Result<MutexGuard<'_, MemoryState>, GatewayError> {
        let state = self.lock();
        if !state.available {
            return Err(GatewayError::Unavailable("connection refused".to_string()));
        }
        Ok(state)
    }

    /// Simulates the runtime going away or coming back.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Makes every subsequent `create` fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    /// Registers a sandbox nobody asked this executor to create.
    pub fn insert_sandbox(&self, handle: &str, properties: Properties) {
        let mut state = self.lock();
        state.sandboxes.insert(
            handle.to_string(),
            MemorySandbox::new(
                SandboxInfo {
                    handle: handle.to_string(),
                    external_ip: EXTERNAL_IP.to_string(),
                    ports: Vec::new(),
                    properties,
                },
                &SandboxSpec::default(),
            ),
        );
    }

    /// Removes a sandbox behind the executor's back.
    pub fn destroy_out_of_band(&self, handle: &str) {
        if let Some(sandbox) = self.lock().sandboxes.remove(handle) {
            sandbox.kill.cancel();
        }
    }

    pub fn sandbox_exists(&self, handle: &str) -> bool {
        self.lock().sandboxes.contains_key(handle)
    }

    pub fn is_stopped(&self, handle: &str) -> bool {
        self.lock()
            .sandboxes
            .get(handle)
            .map(|s| s.stopped)
            .unwrap_or(false)
    }

    pub fn file(&self, handle: &str, path: &str) -> Option<Vec<u8>> {
        self.lock()
            .sandboxes
            .get(handle)
            .and_then(|s| s.files.get(&normalize(path)).cloned())
    }

    pub fn write_file(&self, handle: &str, path: &str, contents: &[u8]) {
        if let Some(sandbox) = self.lock().sandboxes.get_mut(handle) {
            sandbox.files.insert(normalize(path), contents.to_vec());
        }
    }

    /// Processes launched in `handle`, in launch order.
    pub fn processes(&self, handle: &str) -> Vec<ProcessSpec> {
        self.lock()
            .sandboxes
            .get(handle)
            .map(|s| s.processes.clone())
            .unwrap_or_default()
    }

    pub fn sandbox_limits(&self, handle: &str) -> Option<(u64, u64)> {
        self.lock()
            .sandboxes
            .get(handle)
            .map(|s| (s.memory_limit_bytes, s.cpu_shares))
    }

    pub fn sandbox_env(&self, handle: &str) -> Vec<crate::models::EnvironmentVariable> {
        self.lock()
            .sandboxes
            .get(handle)
            .map(|s| s.env.clone())
            .unwrap_or_default()
    }

    fn execute(
        &self,
        handle: String,
        process: ProcessSpec,
        memory_limit_bytes: u64,
    ) -> future::BoxFuture<'static, Result<ProcessExit, GatewayError>> {
        let gateway = self.clone();
        async move {
            let arg = |i: usize| process.args.get(i).cloned().unwrap_or_default();
            match process.path.as_str() {
                "true" => Ok(ProcessExit::code(0)),
                "false" => Ok(ProcessExit::code(1)),
                "exit" => Ok(ProcessExit::code(arg(0).parse().unwrap_or(1))),
                "sleep" => {
                    let seconds: f64 = arg(0).parse().unwrap_or(0.0);
                    tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))).await;
                    Ok(ProcessExit::code(0))
                }
                "hang" => future::pending::<Result<ProcessExit, GatewayError>>().await,
                "oom" => {
                    if memory_limit_bytes == 0 {
                        return future::pending::<Result<ProcessExit, GatewayError>>().await;
                    }
                    Ok(ProcessExit {
                        exit_code: 137,
                        oom_killed: true,
                    })
                }
                "touch" => {
                    gateway.write_file(&handle, &arg(0), b"");
                    Ok(ProcessExit::code(0))
                }
                "write" => {
                    gateway.write_file(&handle, &arg(0), arg(1).as_bytes());
                    Ok(ProcessExit::code(0))
                }
                "once" => {
                    let mut state = gateway.lock();
                    let Some(sandbox) = state.sandboxes.get_mut(&handle) else {
                        return Ok(ProcessExit::code(137));
                    };
                    let marker = normalize(&arg(0));
                    if sandbox.files.contains_key(&marker) {
                        Ok(ProcessExit::code(1))
                    } else {
                        sandbox.files.insert(marker, Vec::new());
                        Ok(ProcessExit::code(0))
                    }
                }
                "nofile" => {
                    let wanted: u64 = arg(0).parse().unwrap_or(0);
                    match process.nofile {
                        Some(limit) if wanted > limit => Ok(ProcessExit::code(2)),
                        _ => Ok(ProcessExit::code(0)),
                    }
                }
                _ => Ok(ProcessExit::code(127)),
            }
        }
        .boxed()
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new(Capacity {
            memory_bytes: 1024 * 1024 * 1024,
            disk_bytes: 1024 * 1024 * 1024,
            max_containers: 256,
        })
    }
}

impl MemorySandbox {
    fn new(info: SandboxInfo, spec: &SandboxSpec) -> Self {
        Self {
            info,
            memory_limit_bytes: spec.memory_limit_bytes,
            cpu_shares: spec.cpu_shares,
            env: spec.env.clone(),
            files: HashMap::new(),
            processes: Vec::new(),
            stopped: false,
            kill: CancellationToken::new(),
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").trim_matches('/').to_string()
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn archive(entries: Vec<(String, Vec<u8>)>) -> Result<Bytes, GatewayError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, &name, data.as_slice())
            .map_err(|e| GatewayError::Runtime(format!("failed to build archive: {e}")))?;
    }
    let bytes = builder
        .into_inner()
        .map_err(|e| GatewayError::Runtime(format!("failed to build archive: {e}")))?;
    Ok(Bytes::from(bytes))
}

fn unarchive(tar: &[u8]) -> Result<Vec<(String, Vec<u8>)>, GatewayError> {
    let invalid = |e: std::io::Error| GatewayError::Runtime(format!("invalid archive: {e}"));
    let mut archive = tar::Archive::new(tar);
    let mut files = Vec::new();
    for entry in archive.entries().map_err(invalid)? {
        let mut entry = entry.map_err(invalid)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().map_err(invalid)?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(invalid)?;
        files.push((path, data));
    }
    Ok(files)
}

#[async_trait]
impl SandboxGateway for InMemoryGateway {
    async fn ping(&self) -> Result<(), GatewayError> {
        self.lock_available().map(|_| ())
    }

    async fn capacity(&self) -> Result<Capacity, GatewayError> {
        Ok(self.lock_available()?.capacity)
    }

    async fn create(&self, spec: SandboxSpec) -> Result<SandboxInfo, GatewayError> {
        let mut state = self.lock_available()?;
        if state.fail_creates {
            return Err(GatewayError::Runtime("sandbox creation rejected".to_string()));
        }
        if !spec.rootfs.is_empty() && !spec.rootfs.starts_with("docker:///") && !spec.rootfs.starts_with('/') {
            return Err(GatewayError::Runtime(format!("unsupported rootfs: {}", spec.rootfs)));
        }
        if state.sandboxes.contains_key(&spec.handle) {
            return Err(GatewayError::Runtime(format!("handle already exists: {}", spec.handle)));
        }

        let mut ports = Vec::with_capacity(spec.ports.len());
        for container_port in &spec.ports {
            ports.push(PortMapping {
                container_port: *container_port,
                host_port: state.next_host_port,
            });
            state.next_host_port = state.next_host_port.wrapping_add(1);
        }

        let info = SandboxInfo {
            handle: spec.handle.clone(),
            external_ip: EXTERNAL_IP.to_string(),
            ports,
            properties: spec.properties.clone(),
        };
        debug!(handle = %spec.handle, "Created in-memory sandbox");
        state
            .sandboxes
            .insert(spec.handle.clone(), MemorySandbox::new(info.clone(), &spec));
        Ok(info)
    }

    async fn run(&self, handle: &str, process: ProcessSpec) -> Result<ProcessHandle, GatewayError> {
        let (kill, memory_limit_bytes) = {
            let mut state = self.lock_available()?;
            let sandbox = state
                .sandboxes
                .get_mut(handle)
                .ok_or_else(|| GatewayError::NotFound(handle.to_string()))?;
            sandbox.processes.push(process.clone());
            (sandbox.kill.clone(), sandbox.memory_limit_bytes)
        };

        let execution = self.execute(handle.to_string(), process, memory_limit_bytes);
        let exit = async move {
            tokio::select! {
                _ = kill.cancelled() => Ok(ProcessExit::code(137)),
                exit = execution => exit,
            }
        }
        .boxed();

        Ok(ProcessHandle::new(Uuid::new_v4().to_string(), exit))
    }

    async fn stop(&self, handle: &str) -> Result<(), GatewayError> {
        let mut state = self.lock_available()?;
        let sandbox = state
            .sandboxes
            .get_mut(handle)
            .ok_or_else(|| GatewayError::NotFound(handle.to_string()))?;
        sandbox.stopped = true;
        let previous = std::mem::replace(&mut sandbox.kill, CancellationToken::new());
        previous.cancel();
        Ok(())
    }

    async fn destroy(&self, handle: &str) -> Result<(), GatewayError> {
        let mut state = self.lock_available()?;
        let sandbox = state
            .sandboxes
            .remove(handle)
            .ok_or_else(|| GatewayError::NotFound(handle.to_string()))?;
        sandbox.kill.cancel();
        Ok(())
    }

    async fn stream_out(&self, handle: &str, path: &str) -> Result<ByteStream, GatewayError> {
        let entries = {
            let state = self.lock_available()?;
            let sandbox = state
                .sandboxes
                .get(handle)
                .ok_or_else(|| GatewayError::NotFound(handle.to_string()))?;
            let wanted = normalize(path);
            if let Some(data) = sandbox.files.get(&wanted) {
                vec![(base_name(&wanted).to_string(), data.clone())]
            } else {
                let prefix = format!("{wanted}/");
                let dir = base_name(&wanted).to_string();
                let mut entries: Vec<(String, Vec<u8>)> = sandbox
                    .files
                    .iter()
                    .filter(|(name, _)| wanted.is_empty() || name.starts_with(&prefix))
                    .map(|(name, data)| {
                        let relative = name.strip_prefix(&prefix).unwrap_or(name);
                        (format!("{dir}/{relative}").trim_start_matches('/').to_string(), data.clone())
                    })
                    .collect();
                if entries.is_empty() {
                    return Err(GatewayError::Runtime(format!("no such file or directory: {path}")));
                }
                entries.sort();
                entries
            }
        };

        let tar = archive(entries)?;
        Ok(Box::pin(stream::once(future::ready(Ok::<_, GatewayError>(tar)))))
    }

    async fn stream_in(&self, handle: &str, path: &str, tar: Bytes) -> Result<(), GatewayError> {
        let files = unarchive(&tar)?;
        let mut state = self.lock_available()?;
        let sandbox = state
            .sandboxes
            .get_mut(handle)
            .ok_or_else(|| GatewayError::NotFound(handle.to_string()))?;
        let dest = normalize(path);
        for (name, data) in files {
            let key = if dest.is_empty() {
                normalize(&name)
            } else {
                format!("{dest}/{}", normalize(&name))
            };
            sandbox.files.insert(key, data);
        }
        Ok(())
    }

    async fn lookup(&self, handle: &str) -> Result<SandboxInfo, GatewayError> {
        self.lock_available()?
            .sandboxes
            .get(handle)
            .map(|s| s.info.clone())
            .ok_or_else(|| GatewayError::NotFound(handle.to_string()))
    }

    async fn list(&self, properties: &Properties) -> Result<Vec<String>, GatewayError> {
        let state = self.lock_available()?;
        let mut handles: Vec<String> = state
            .sandboxes
            .values()
            .filter(|s| {
                properties
                    .iter()
                    .all(|(k, v)| s.info.properties.get(k) == Some(v))
            })
            .map(|s| s.info.handle.clone())
            .collect();
        handles.sort();
        Ok(handles)
    }
}
