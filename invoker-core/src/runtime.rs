//! Container runtime capability used by the launcher and the reconciler
//!
//! Only five primitives are needed: list by exact name, state and exit code
//! by name, stop, remove, and create-and-start. `DockerCli` drives the
//! `docker` binary; `MemoryRuntime` is an in-process fake for tests.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Default bound on a single runtime call
pub const DEFAULT_RUNTIME_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container {0} not found")]
    NotFound(String),

    /// State is unknown, never treat this as a dead container
    #[error("container runtime did not answer for {name} within {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to parse runtime output: {0}")]
    Parse(String),

    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A container as reported by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    /// Lifecycle state such as `running` or `exited`
    pub state: String,
    /// Human status such as `Exited (1) 2 hours ago`
    pub status: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    pub fn exit_code(&self) -> Result<i64, RuntimeError> {
        parse_exit_code(&self.status)
    }
}

/// Lifecycle state and exit code of one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub state: String,
    pub exit_code: i64,
}

/// Exit code from a status line; statuses without `Exited (N)` yield 0
pub fn parse_exit_code(status: &str) -> Result<i64, RuntimeError> {
    let Some(start) = status.find("Exited (") else {
        return Ok(0);
    };
    let rest = &status[start + "Exited (".len()..];
    let digits = rest
        .split_once(')')
        .map(|(code, _)| code)
        .ok_or_else(|| RuntimeError::Parse(format!("unterminated exit code in {:?}", status)))?;

    digits
        .trim()
        .parse::<i64>()
        .map_err(|e| RuntimeError::Parse(format!("exit code {:?}: {}", digits, e)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    pub path_on_host: String,
    pub path_in_container: String,
    pub cgroup_permissions: String,
}

impl DeviceMapping {
    /// Same path on both sides with `rwm` permissions
    pub fn passthrough(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            path_on_host: path.clone(),
            path_in_container: path,
            cgroup_permissions: "rwm".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

/// Log driver settings passed through to the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct LogConfig {
    #[serde(rename = "Type", alias = "type")]
    pub driver: String,
    #[serde(rename = "Config", alias = "config", default)]
    pub config: BTreeMap<String, String>,
}

impl LogConfig {
    /// Load from a JSON file of the form `{"Type": ..., "Config": {...}}`
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data)
            .map_err(|e| RuntimeError::Parse(format!("log config {}: {}", path.display(), e)))
    }

    /// Tag the awslogs stream with the node rank
    pub fn with_stream_prefix(mut self, rank: usize) -> Self {
        self.config
            .insert("awslogs-stream-prefix".to_string(), rank.to_string());
        self
    }
}

/// Everything needed to create and start a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Entrypoint command followed by its arguments
    pub entrypoint: Vec<String>,
    /// `KEY=VALUE` pairs
    pub env: Vec<String>,
    /// `host:guest` bind mounts
    pub binds: Vec<String>,
    pub devices: Vec<DeviceMapping>,
    /// Request every GPU on the host
    pub gpus: bool,
    pub cap_add: Vec<String>,
    pub privileged: bool,
    pub ulimits: Vec<Ulimit>,
    pub host_namespaces: bool,
    pub log_config: Option<LogConfig>,
}

/// The capability the core depends on
pub trait ContainerRuntime {
    /// Containers whose name is exactly `name`, including stopped ones
    fn list_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Vec<ContainerSummary>, RuntimeError>> + Send;

    /// `RuntimeError::NotFound` when no container has exactly this name
    fn status_by_name(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<ContainerStatus, RuntimeError>> + Send;

    fn stop(&self, id: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    fn remove(&self, id: &str) -> impl Future<Output = Result<(), RuntimeError>> + Send;

    /// Returns the new container id
    fn create_and_start(
        &self,
        spec: &ContainerSpec,
    ) -> impl Future<Output = Result<String, RuntimeError>> + Send;
}

/// Stop and remove every container named `name`
///
/// A failed stop is logged and the remove is still attempted; a failed remove
/// is an error.
pub async fn kill_by_name<R: ContainerRuntime>(runtime: &R, name: &str) -> Result<usize, RuntimeError> {
    let containers = runtime.list_by_name(name).await?;
    info!("Runtime: Found {} containers with name {}", containers.len(), name);

    for c in &containers {
        if c.is_running() {
            info!("Runtime: Stopping container {}", c.id);
            if let Err(e) = runtime.stop(&c.id).await {
                warn!("Runtime: Failed to stop container {}: {}", c.id, e);
            }
        }

        info!("Runtime: Removing container {}", c.id);
        runtime.remove(&c.id).await?;
    }

    Ok(containers.len())
}

/// One line of `docker ps --format '{{json .}}'`
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
    #[serde(rename = "Status", default)]
    status: String,
}

/// Drives the `docker` command line
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    /// Run one docker command under the timeout and return its stdout
    async fn exec(&self, args: &[String], subject: &str) -> Result<String, RuntimeError> {
        let command = format!("{} {}", self.bin, args.join(" "));
        debug!("Docker: {}", command);

        let mut cmd = Command::new(&self.bin);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    name: subject.to_string(),
                    after: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Build `tag` from the Dockerfile in `context`, streaming output to the terminal
    pub async fn build_image(
        &self,
        context: &Path,
        tag: &str,
        build_args: &[(String, String)],
    ) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("build").arg("-t").arg(tag).arg("--rm").arg("--force-rm");
        for (key, value) in build_args {
            cmd.arg("--build-arg").arg(format!("{}={}", key, value));
        }
        cmd.arg(context).stdin(Stdio::null());

        info!("Docker: Building image {}", tag);
        let status = cmd.status().await?;
        if !status.success() {
            return Err(RuntimeError::CommandFailed {
                command: format!("{} build -t {}", self.bin, tag),
                stderr: format!("exited with {}", status),
            });
        }
        Ok(())
    }

    /// Arguments for `docker create`
    pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];

        for env in &spec.env {
            args.extend(["-e".to_string(), env.clone()]);
        }
        for bind in &spec.binds {
            args.extend(["-v".to_string(), bind.clone()]);
        }
        for dev in &spec.devices {
            args.extend([
                "--device".to_string(),
                format!(
                    "{}:{}:{}",
                    dev.path_on_host, dev.path_in_container, dev.cgroup_permissions
                ),
            ]);
        }
        if spec.gpus {
            args.extend(["--gpus".to_string(), "all".to_string()]);
        }
        for cap in &spec.cap_add {
            args.extend(["--cap-add".to_string(), cap.clone()]);
        }
        if spec.privileged {
            args.push("--privileged".to_string());
        }
        for ulimit in &spec.ulimits {
            args.extend([
                "--ulimit".to_string(),
                format!("{}={}:{}", ulimit.name, ulimit.soft, ulimit.hard),
            ]);
        }
        if spec.host_namespaces {
            for ns in ["--network", "--ipc", "--pid"] {
                args.extend([ns.to_string(), "host".to_string()]);
            }
        }
        if let Some(log) = &spec.log_config {
            args.extend(["--log-driver".to_string(), log.driver.clone()]);
            for (key, value) in &log.config {
                args.extend(["--log-opt".to_string(), format!("{}={}", key, value)]);
            }
        }

        let mut entry = spec.entrypoint.iter();
        if let Some(cmd) = entry.next() {
            args.extend(["--entrypoint".to_string(), cmd.clone()]);
        }
        args.push(spec.image.clone());
        args.extend(entry.cloned());
        args
    }
}

impl ContainerRuntime for DockerCli {
    async fn list_by_name(&self, name: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let args = [
            "ps".to_string(),
            "-a".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("name={}", name),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        let stdout = self.exec(&args, name).await?;

        let mut found = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            let ps: PsLine = serde_json::from_str(line)
                .map_err(|e| RuntimeError::Parse(format!("docker ps line {:?}: {}", line, e)))?;

            // The filter is a substring match; keep exact names only
            if ps.names.split(',').any(|n| n.trim_start_matches('/') == name) {
                found.push(ContainerSummary {
                    id: ps.id,
                    name: name.to_string(),
                    state: ps.state,
                    status: ps.status,
                });
            }
        }

        debug!("Docker: {} containers named {}", found.len(), name);
        Ok(found)
    }

    async fn status_by_name(&self, name: &str) -> Result<ContainerStatus, RuntimeError> {
        let containers = self.list_by_name(name).await?;
        let c = containers
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;

        Ok(ContainerStatus {
            exit_code: c.exit_code()?,
            state: c.state,
        })
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let args = ["stop".to_string(), "-t".to_string(), "0".to_string(), id.to_string()];
        self.exec(&args, id).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let args = ["rm".to_string(), "-f".to_string(), id.to_string()];
        self.exec(&args, id).await.map(|_| ())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        info!("Docker: Creating container {}", spec.name);
        let stdout = self.exec(&Self::create_args(spec), &spec.name).await?;
        let id = stdout
            .lines()
            .last()
            .map(|l| l.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RuntimeError::Parse("docker create printed no id".to_string()))?;

        info!("Docker: Starting container {}", spec.name);
        self.exec(&["start".to_string(), id.clone()], &spec.name).await?;
        info!("Docker: Started container {} ({})", spec.name, id);
        Ok(id)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    containers: Vec<ContainerSummary>,
    created: Vec<ContainerSpec>,
    unreachable: bool,
    next_id: u64,
}

/// In-memory runtime for testing
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a container; `exit_code` is rendered into its status line
    pub fn insert(&self, name: &str, state: &str, exit_code: i64) -> String {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = format!("c{}", inner.next_id);
        let status = if state == "running" {
            "Up 5 minutes".to_string()
        } else {
            format!("Exited ({}) 5 minutes ago", exit_code)
        };
        inner.containers.push(ContainerSummary {
            id: id.clone(),
            name: name.to_string(),
            state: state.to_string(),
            status,
        });
        id
    }

    /// Make every call fail as if the daemon were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    pub fn containers(&self) -> Vec<ContainerSummary> {
        self.lock().containers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), RuntimeError> {
        if self.lock().unreachable {
            return Err(RuntimeError::CommandFailed {
                command: "memory".to_string(),
                stderr: "cannot connect to the container daemon".to_string(),
            });
        }
        Ok(())
    }
}

impl ContainerRuntime for MemoryRuntime {
    async fn list_by_name(&self, name: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.check_reachable()?;
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect())
    }

    async fn status_by_name(&self, name: &str) -> Result<ContainerStatus, RuntimeError> {
        let c = self
            .list_by_name(name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
        Ok(ContainerStatus {
            exit_code: c.exit_code()?,
            state: c.state,
        })
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        let mut inner = self.lock();
        let c = inner
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        c.state = "exited".to_string();
        c.status = "Exited (137) 1 second ago".to_string();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        let mut inner = self.lock();
        let before = inner.containers.len();
        inner.containers.retain(|c| c.id != id);
        if inner.containers.len() == before {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.check_reachable()?;
        let id = self.insert(&spec.name, "running", 0);
        self.lock().created.push(spec.clone());
        Ok(id)
    }
}
