//! Translation of a job config and node role into a container launch

use crate::rank::Role;
use crate::runtime::{ContainerSpec, DeviceMapping, LogConfig, Ulimit};
use crate::types::JobConfig;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_IMAGE_TAG: &str = "hf-torch:latest";

/// Distributed launcher binary inside the image
pub const LAUNCHER: &str = "torchrun";

pub const ENTRY_SCRIPT_NAME: &str = "hf.py";

/// Env file read from the project root and passed to the container
pub const NCCL_ENV_FILE: &str = "nccl_config_env";

const ENTRY_SCRIPT: &str = "#!/usr/bin/env python
from higgsfield.internal.main import cli;
cli()
";

const GUEST_ROOT_PATH: &str = "/srv/";
const GUEST_CACHE_PATH: &str = "/home/nonroot/.cache/";
const GUEST_ROOT_CACHE_PATH: &str = "/root/.cache/";

const CAP_ADD: [&str; 4] = ["NET_ADMIN", "SYS_ADMIN", "SYS_PTRACE", "IPC_LOCK"];

/// Host library dirs bound into the container when present
const LIBRARY_BINDS: [(&str, &str); 3] = [
    ("/var/lib/nvidia/lib64", "/usr/local/nvidia/lib64"),
    ("/var/lib/tcpx", "/usr/local/tcpx"),
    ("/run/tcpx", "/run/tcpx"),
];

const EXTRA_NVIDIA_DEVICES: [&str; 4] = [
    "/dev/nvidia-uvm",
    "/dev/nvidiactl",
    "/dev/nvidia-modeset",
    "/dev/nvidia-uvm-tools",
];

const MAX_GPUS: usize = 32;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("HOME is not set")]
    NoHome,

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("env file {path}: {reason}")]
    EnvFile { path: PathBuf, reason: String },

    #[error("launch I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Launcher command and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub command: String,
    pub args: Vec<String>,
}

impl LaunchPlan {
    pub fn build(config: &JobConfig, role: &Role) -> Self {
        let mut args = vec![
            "--nnodes".to_string(),
            role.world_size().to_string(),
            "--node_rank".to_string(),
            role.rank().to_string(),
            "--nproc_per_node".to_string(),
            config.nproc_per_node.to_string(),
        ];

        if let Some(master) = role.master() {
            args.extend([
                "--master_addr".to_string(),
                master.to_string(),
                "--master_port".to_string(),
                config.port.to_string(),
            ]);
        }

        if let Some(no_python) = config.no_python.as_deref().filter(|v| !v.is_empty()) {
            args.extend([
                "--no-python".to_string(),
                no_python.to_string(),
                "python".to_string(),
            ]);
        }

        args.extend([
            ENTRY_SCRIPT_NAME.to_string(),
            "run".to_string(),
            "--experiment_name".to_string(),
            config.experiment_name.clone(),
            "--run_name".to_string(),
            config.run_name.clone(),
            "--max_repeats".to_string(),
            config.max_repeats.to_string(),
        ]);
        args.extend(config.rest.iter().cloned());

        Self {
            command: LAUNCHER.to_string(),
            args,
        }
    }

    /// Command followed by arguments, as a container entrypoint
    pub fn entrypoint(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// Host directories a launch needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDirs {
    /// `~/.cache`, bound into the container
    pub cache: PathBuf,
    /// `~/.cache/higgsfield/<project>/experiments/<experiment>/<run>`
    pub checkpoint: PathBuf,
}

impl JobDirs {
    pub fn under(home: &Path, config: &JobConfig) -> Self {
        let cache = home.join(".cache");
        let checkpoint = cache
            .join("higgsfield")
            .join(&config.project_name)
            .join("experiments")
            .join(&config.experiment_name)
            .join(&config.run_name);
        Self { cache, checkpoint }
    }

    /// Resolve under `$HOME` and create both directories
    pub fn create(config: &JobConfig) -> Result<Self, LaunchError> {
        let home = std::env::var_os("HOME").ok_or(LaunchError::NoHome)?;
        let dirs = Self::under(Path::new(&home), config);
        for dir in [&dirs.cache, &dirs.checkpoint] {
            fs::create_dir_all(dir).map_err(|source| LaunchError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(dirs)
    }
}

/// Inputs to the container spec that come from the host
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    pub project_root: PathBuf,
    pub cache_dir: PathBuf,
    pub env: Vec<String>,
    pub log_config: Option<LogConfig>,
}

/// Container spec for one node of a job
pub fn container_spec(
    config: &JobConfig,
    plan: &LaunchPlan,
    image: &str,
    host: &HostEnvironment,
) -> ContainerSpec {
    let mut binds = vec![
        format!("{}:{}", host.project_root.display(), GUEST_ROOT_PATH),
        format!("{}:{}", host.cache_dir.display(), GUEST_CACHE_PATH),
        format!("{}:{}", host.cache_dir.display(), GUEST_ROOT_CACHE_PATH),
    ];
    for (on_host, in_guest) in LIBRARY_BINDS {
        if Path::new(on_host).exists() {
            info!("Launch: Adding bind {}:{}", on_host, in_guest);
            binds.push(format!("{}:{}", on_host, in_guest));
        }
    }

    let has_gpu = Path::new("/dev/nvidia0").exists();
    let devices = if has_gpu {
        info!("Launch: Host has GPUs, mapping NVIDIA devices");
        nvidia_devices()
    } else {
        info!("Launch: Host has no GPU");
        Vec::new()
    };

    ContainerSpec {
        name: config.container_name(),
        image: image.to_string(),
        entrypoint: plan.entrypoint(),
        env: host.env.clone(),
        binds,
        devices,
        // COS hosts expose GPUs through device mappings only
        gpus: has_gpu && !is_cos(),
        cap_add: CAP_ADD.iter().map(|c| c.to_string()).collect(),
        privileged: true,
        ulimits: vec![
            Ulimit {
                name: "memlock".to_string(),
                soft: -1,
                hard: -1,
            },
            Ulimit {
                name: "stack".to_string(),
                soft: 67108864,
                hard: 67108864,
            },
        ],
        host_namespaces: true,
        log_config: host.log_config.clone(),
    }
}

fn nvidia_devices() -> Vec<DeviceMapping> {
    let gpus = (0..MAX_GPUS).map(|i| format!("/dev/nvidia{}", i));
    let extra = EXTRA_NVIDIA_DEVICES.iter().map(|d| d.to_string());

    gpus.chain(extra)
        .filter(|path| Path::new(path).exists())
        .map(DeviceMapping::passthrough)
        .collect()
}

/// Container-Optimized OS reports `ID=cos` in os-release
fn is_cos() -> bool {
    fs::read_to_string("/etc/os-release")
        .map(|data| os_release_id(&data) == Some("cos"))
        .unwrap_or(false)
}

fn os_release_id(data: &str) -> Option<&str> {
    data.lines()
        .find_map(|line| line.strip_prefix("ID="))
        .map(|id| id.trim().trim_matches('"'))
}

/// Write the launcher entry script into `dir`
pub fn write_entry_script(dir: &Path) -> Result<PathBuf, LaunchError> {
    let path = dir.join(ENTRY_SCRIPT_NAME);
    fs::write(&path, ENTRY_SCRIPT)?;
    debug!("Launch: Wrote {}", path.display());
    Ok(path)
}

/// `KEY=VALUE` lines of an env file; a missing file yields nothing
pub fn load_env_file(path: &Path) -> Result<Vec<String>, LaunchError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    parse_env(file).map_err(|e| LaunchError::EnvFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn parse_env<R: io::Read>(reader: R) -> Result<Vec<String>, dotenvy::Error> {
    dotenvy::from_read_iter(reader)
        .map(|item| item.map(|(key, value)| format!("{}={}", key, value)))
        .collect()
}

/// Build args passing the real uid/gid of the invoking user into the image
#[cfg(unix)]
pub fn host_user_build_args() -> Result<Vec<(String, String)>, LaunchError> {
    use nix::unistd::{getgid, getuid};

    Ok(vec![
        ("GID".to_string(), getgid().to_string()),
        ("UID".to_string(), getuid().to_string()),
    ])
}

#[cfg(not(unix))]
pub fn host_user_build_args() -> Result<Vec<(String, String)>, LaunchError> {
    Ok(Vec::new())
}

/// Shorten a path for display, replacing `/home/<user>` with `~`
pub fn trim_path(path: &str, max_len: usize) -> String {
    if path.len() < max_len {
        return path.to_string();
    }

    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let branches: Vec<&str> = trimmed.split('/').collect();
    if branches.len() == 1 {
        return truncate(trimmed, max_len).to_string();
    }

    let shortened = if branches[0] == "home" && branches.len() > 2 {
        format!("~/{}", branches[2..].join("/"))
    } else {
        trimmed.to_string()
    };

    if shortened.len() < max_len {
        shortened
    } else {
        format!("{}...", truncate(&shortened, max_len))
    }
}

fn truncate(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Training info banner shown before launch
pub fn banner(config: &JobConfig, container: &str, checkpoint: &Path) -> String {
    let checkpoint = trim_path(&checkpoint.display().to_string(), 70);
    let rule = "═".repeat(100);
    format!(
        "\n╔{rule}\n║\n║  > Training info:\n║\n\
         ║  > EXPERIMENT NAME  = {}\n\
         ║  > RUN NAME         = {}\n\
         ║  > CONTAINER NAME   = {}\n\
         ║  > MODEL CHKPT PATH = {}\n║\n╚{rule}\n",
        config.experiment_name, config.run_name, container, checkpoint,
    )
}
