//! Subcommand handlers

use crate::{RestartArgs, RunArgs};
use invoker_core::addrs::NodeAddresses;
use invoker_core::config::{InvokerConfig, RemoteConfig};
use invoker_core::exchange::{PageExchange, RemoteExchange};
use invoker_core::launch::{self, HostEnvironment, JobDirs, LaunchPlan, NCCL_ENV_FILE};
use invoker_core::rank::{ensure_role_port, resolve_role, RankError};
use invoker_core::reconcile::{produce_local_page, Reconciler};
use invoker_core::runtime::{kill_by_name, ContainerRuntime, LogConfig};
use invoker_core::store::StateStore;
use invoker_core::types::{JobConfig, LOCALHOST};
use std::path::Path;
use std::process::{ExitCode, Stdio};
use tokio::process::Command;
use tracing::{error, info, warn};

type CommandResult = Result<ExitCode, Box<dyn std::error::Error>>;

impl RunArgs {
    fn job_config(&self) -> JobConfig {
        JobConfig {
            project_name: self.project_name.clone(),
            hosts: self.hosts.clone(),
            nproc_per_node: self.nproc_per_node,
            experiment_name: self.experiment_name.clone(),
            port: self.port,
            run_name: self.run_name.clone(),
            max_repeats: self.max_repeats,
            rest: self.rest.clone(),
            container_name: self.container_name.clone(),
            master_host: self.master_host.clone(),
            no_python: self.no_python.clone(),
        }
    }
}

/// Addresses of this node; single-node jobs need no lookup
async fn node_addresses(config: &InvokerConfig, job: &JobConfig) -> Result<NodeAddresses, Box<dyn std::error::Error>> {
    if job.is_single_node() {
        return Ok(NodeAddresses::new(LOCALHOST, Vec::new()));
    }
    Ok(NodeAddresses::discover(&config.public_ip_url).await?)
}

pub async fn run(config: &InvokerConfig, args: RunArgs) -> CommandResult {
    let job = args.job_config();
    job.validate()?;

    let addrs = node_addresses(config, &job).await?;
    let role = match resolve_role(&job.hosts, job.master(), &addrs) {
        Ok(role) => role,
        Err(e @ RankError::HostNotInList { .. }) => {
            info!("{}", e);
            return Ok(ExitCode::SUCCESS);
        }
        Err(e) => return Err(e.into()),
    };

    ensure_role_port(&role, job.port)?;

    let docker = config.docker();
    let container = job.container_name();
    kill_by_name(&docker, &container).await?;

    let project_root = std::fs::canonicalize(&args.project_root)?;
    let dirs = JobDirs::create(&job)?;
    launch::write_entry_script(&project_root)?;
    let env = launch::load_env_file(&project_root.join(NCCL_ENV_FILE))?;

    docker
        .build_image(&project_root, &config.image_tag, &launch::host_user_build_args()?)
        .await?;

    let log_config = match &args.log_config {
        Some(path) => Some(LogConfig::load(path)?.with_stream_prefix(role.rank())),
        None => None,
    };

    let plan = LaunchPlan::build(&job, &role);
    let host = HostEnvironment {
        project_root,
        cache_dir: dirs.cache.clone(),
        env,
        log_config,
    };
    let spec = launch::container_spec(&job, &plan, &config.image_tag, &host);

    println!("{}", launch::banner(&job, &container, &dirs.checkpoint));
    let id = docker.create_and_start(&spec).await?;
    info!("Run: Started container {} ({})", container, id);

    let mut store = StateStore::open_and_load(&config.state_dir)?;
    store.set(job.key(), job.desired_state(), job.clone());
    store.flush()?;

    Ok(ExitCode::SUCCESS)
}

pub async fn fetch(config: &InvokerConfig, project: &str) -> CommandResult {
    let store = StateStore::open_and_load(&config.state_dir)?;
    let addrs = NodeAddresses::discover(&config.public_ip_url).await?;
    let docker = config.docker();

    let page = produce_local_page(&store, &docker, &addrs, Some(project)).await?;

    // Printing to stdout is the sending side of the remote exchange
    let exchange = RemoteExchange::new(&config.remote.shell, &config.remote.invoker_exec, Vec::new());
    exchange.send_local(&page).await?;
    Ok(ExitCode::SUCCESS)
}

pub async fn restart(config: &InvokerConfig, args: RestartArgs) -> CommandResult {
    let exchange = RemoteExchange::new(
        &config.remote.shell,
        &config.remote.invoker_exec,
        args.hosts.clone(),
    )
    .with_fetch_args(fetch_args(config, &args.project_name))
    .with_timeout(config.remote.timeout);

    let pages = exchange.receive_peers(args.hosts.len()).await?;

    let mut reconciler = Reconciler::new();
    for page in pages {
        reconciler.absorb(page);
    }
    let decision = reconciler.decide();

    for conflict in &decision.conflicts {
        error!("Restart: {}", conflict);
    }

    let mut failed_launches = 0;
    for (key, job) in &decision.restart {
        info!("Restart: Relaunching {} on {:?}", key, job.hosts);
        for host in &job.hosts {
            let cmd = relaunch_command(&config.remote, host, job, args.project_root.as_deref());
            if args.dry_run {
                println!("{}", cmd.join(" "));
                continue;
            }
            if let Err(e) = spawn_remote(&cmd).await {
                warn!("Restart: Relaunch of {} on {} failed: {}", key, host, e);
                failed_launches += 1;
            }
        }
    }

    let summary = serde_json::json!({
        "project": args.project_name,
        "restarted": decision.restart.keys().map(|k| k.to_string()).collect::<Vec<_>>(),
        "conflicts": decision.conflicts.iter().map(|c| c.key.to_string()).collect::<Vec<_>>(),
        "failed_launches": failed_launches,
        "dry_run": args.dry_run,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if decision.has_conflicts() || failed_launches > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn kill(config: &InvokerConfig, name: &str) -> CommandResult {
    let removed = kill_by_name(&config.docker(), name).await?;
    println!("Removed {} containers named {}", removed, name);
    Ok(ExitCode::SUCCESS)
}

/// Arguments of the remote `fetch`, carrying this node's global settings
fn fetch_args(config: &InvokerConfig, project: &str) -> Vec<String> {
    vec![
        "--project-name".to_string(),
        project.to_string(),
        "--state-dir".to_string(),
        config.state_dir.display().to_string(),
        "--docker-bin".to_string(),
        config.runtime.docker_bin.clone(),
        "--runtime-timeout-secs".to_string(),
        config.runtime.timeout.as_secs().to_string(),
        "--public-ip-url".to_string(),
        config.public_ip_url.clone(),
    ]
}

/// `<shell> <host> <invoker> run ...` reproducing `job` on `host`
fn relaunch_command(
    remote: &RemoteConfig,
    host: &str,
    job: &JobConfig,
    project_root: Option<&Path>,
) -> Vec<String> {
    let mut cmd = vec![
        remote.shell.clone(),
        host.to_string(),
        remote.invoker_exec.clone(),
        "run".to_string(),
        "--project-name".to_string(),
        job.project_name.clone(),
        "--experiment-name".to_string(),
        job.experiment_name.clone(),
        "--run-name".to_string(),
        job.run_name.clone(),
        "--hosts".to_string(),
        job.hosts.join(","),
        "--nproc-per-node".to_string(),
        job.nproc_per_node.to_string(),
        "--port".to_string(),
        job.port.to_string(),
        "--max-repeats".to_string(),
        job.max_repeats.to_string(),
    ];

    let optional = [
        ("--container-name", job.container_name.as_deref()),
        ("--master-host", job.master_host.as_deref()),
        ("--no-python", job.no_python.as_deref()),
    ];
    for (flag, value) in optional {
        if let Some(value) = value {
            cmd.extend([flag.to_string(), value.to_string()]);
        }
    }
    if let Some(root) = project_root {
        cmd.extend(["--project-root".to_string(), root.display().to_string()]);
    }

    cmd.push("--".to_string());
    cmd.extend(job.rest.iter().cloned());
    cmd
}

async fn spawn_remote(cmd: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let (program, args) = cmd.split_first().ok_or("empty command")?;
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        return Err(format!("exited with {}", status).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job() -> JobConfig {
        JobConfig {
            project_name: "proj".to_string(),
            hosts: vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()],
            nproc_per_node: 8,
            experiment_name: "exp".to_string(),
            port: 1234,
            run_name: "main".to_string(),
            max_repeats: -1,
            rest: vec!["hf_action_restartable=running".to_string()],
            container_name: None,
            master_host: Some("10.0.0.9".to_string()),
            no_python: None,
        }
    }

    #[test]
    fn test_relaunch_command() {
        let cmd = relaunch_command(&RemoteConfig::default(), "10.0.0.2", &job(), None);
        assert_eq!(
            cmd.join(" "),
            "ssh 10.0.0.2 invoker run --project-name proj --experiment-name exp \
             --run-name main --hosts 10.0.0.1,10.0.0.2 --nproc-per-node 8 --port 1234 \
             --max-repeats -1 --master-host 10.0.0.9 -- hf_action_restartable=running"
        );
    }

    #[test]
    fn test_relaunch_reproduces_config() {
        use crate::{Cli, Commands};
        use clap::Parser;

        let original = job();
        let cmd = relaunch_command(&RemoteConfig::default(), "10.0.0.1", &original, Some(Path::new("/work")));
        // Drop `ssh <host>`; the rest is an invoker command line
        let cli = Cli::try_parse_from(&cmd[2..]).unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.job_config(), original);
        assert_eq!(args.project_root, PathBuf::from("/work"));
    }

    #[test]
    fn test_fetch_forwards_global_flags() {
        use crate::{Cli, Commands};
        use clap::Parser;
        use std::time::Duration;

        let config = InvokerConfig::default()
            .with_state_dir("/var/lib/invoker")
            .with_docker_bin("podman")
            .with_runtime_timeout(Duration::from_secs(5));

        // The peer parses exactly what the coordinator sends
        let mut argv = vec!["invoker".to_string(), "fetch".to_string()];
        argv.extend(fetch_args(&config, "proj"));
        let cli = Cli::try_parse_from(&argv).unwrap();
        let peer = cli.invoker_config();

        assert!(matches!(cli.command, Commands::Fetch { ref project_name } if project_name == "proj"));
        assert_eq!(peer.state_dir, PathBuf::from("/var/lib/invoker"));
        assert_eq!(peer.runtime.docker_bin, "podman");
        assert_eq!(peer.runtime.timeout, Duration::from_secs(5));
        assert_eq!(peer.public_ip_url, config.public_ip_url);
    }

    #[tokio::test]
    async fn test_spawn_remote_failure() {
        assert!(spawn_remote(&["true".to_string()]).await.is_ok());
        assert!(spawn_remote(&["false".to_string()]).await.is_err());
        assert!(spawn_remote(&[]).await.is_err());
    }
}
