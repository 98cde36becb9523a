//! Invoker - launcher and restart controller for distributed training jobs
//!
//! - `run` - Launch this node's share of a job inside a container
//! - `fetch` - Print this node's observations of a project's jobs
//! - `restart` - Gather pages from all hosts and relaunch failed jobs
//! - `kill` - Stop and remove containers by name
//!
//! # Usage
//!
//! ```bash
//! invoker run --project-name proj --experiment-name exp --run-name main \
//!     --hosts 10.0.0.1,10.0.0.2 --nproc-per-node 8 --port 1234 \
//!     -- hf_action_restartable=running
//!
//! invoker restart --project-name proj --hosts 10.0.0.1,10.0.0.2
//! ```

mod commands;

use clap::{Args, Parser, Subcommand};
use invoker_core::config::InvokerConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "invoker")]
#[command(about = "Launch and restart multi-node training jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter (trace, debug, info, warn, error); falls back to RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory holding persisted job states
    #[arg(long, global = true, default_value = invoker_core::store::DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Timeout for each container runtime query (seconds)
    #[arg(long, global = true, default_value = "30")]
    runtime_timeout_secs: u64,

    /// Docker CLI binary
    #[arg(long, global = true, default_value = "docker")]
    docker_bin: String,

    /// Service answering with this node's public IP
    #[arg(long, global = true, default_value = invoker_core::addrs::DEFAULT_PUBLIC_IP_URL)]
    public_ip_url: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch this node's share of a job
    Run(RunArgs),

    /// Print this node's page for a project as JSON
    Fetch {
        /// Project to report on
        #[arg(long)]
        project_name: String,
    },

    /// Reconcile pages from all hosts and relaunch jobs that need it
    Restart(RestartArgs),

    /// Stop and remove every container with this name
    Kill {
        /// Exact container name
        #[arg(long)]
        name: String,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[arg(long)]
    project_name: String,

    #[arg(long)]
    experiment_name: String,

    #[arg(long, default_value = "main")]
    run_name: String,

    /// Comma separated host list; `localhost` for a single-node job
    #[arg(long, value_delimiter = ',', required = true)]
    hosts: Vec<String>,

    #[arg(long, default_value = "1")]
    nproc_per_node: u32,

    /// Master port
    #[arg(long, default_value = "1234")]
    port: u16,

    /// Maximum repeats of the run, -1 for unlimited
    #[arg(long, default_value = "-1", allow_negative_numbers = true)]
    max_repeats: i64,

    #[arg(long)]
    container_name: Option<String>,

    /// Master address, instead of the first host
    #[arg(long)]
    master_host: Option<String>,

    /// Python interpreter passed as `--no-python <v> python`
    #[arg(long)]
    no_python: Option<String>,

    /// JSON log driver config
    #[arg(long)]
    log_config: Option<PathBuf>,

    /// Project directory holding the Dockerfile
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Image tag to build and run
    #[arg(long, default_value = invoker_core::launch::DEFAULT_IMAGE_TAG)]
    image_tag: String,

    /// Arguments passed through to the training script
    #[arg(last = true)]
    rest: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct RestartArgs {
    #[arg(long)]
    project_name: String,

    /// Hosts to gather pages from
    #[arg(long, value_delimiter = ',', required = true)]
    hosts: Vec<String>,

    /// Invoker binary on the remote hosts
    #[arg(long, default_value = "invoker")]
    invoker_exec: String,

    /// Remote shell used to reach the hosts
    #[arg(long, default_value = "ssh")]
    remote_shell: String,

    /// Timeout for each remote command (seconds)
    #[arg(long, default_value = "60")]
    remote_timeout_secs: u64,

    /// Project directory on the remote hosts
    #[arg(long)]
    project_root: Option<PathBuf>,

    /// Print relaunch commands without running them
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn invoker_config(&self) -> InvokerConfig {
        let mut config = InvokerConfig::default()
            .with_state_dir(self.state_dir.clone())
            .with_docker_bin(self.docker_bin.clone())
            .with_runtime_timeout(Duration::from_secs(self.runtime_timeout_secs))
            .with_public_ip_url(self.public_ip_url.clone());

        match &self.command {
            Commands::Run(args) => {
                config = config.with_image_tag(args.image_tag.clone());
            }
            Commands::Restart(args) => {
                config = config
                    .with_remote(args.remote_shell.clone(), args.invoker_exec.clone())
                    .with_remote_timeout(Duration::from_secs(args.remote_timeout_secs));
            }
            Commands::Fetch { .. } | Commands::Kill { .. } => {}
        }
        config
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    // stdout carries pages and summaries
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());
    let config = cli.invoker_config();

    let result = match cli.command {
        Commands::Run(args) => commands::run(&config, args).await,
        Commands::Fetch { project_name } => commands::fetch(&config, &project_name).await,
        Commands::Restart(args) => commands::restart(&config, args).await,
        Commands::Kill { name } => commands::kill(&config, &name).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "invoker",
            "run",
            "--project-name",
            "proj",
            "--experiment-name",
            "exp",
            "--hosts",
            "10.0.0.1,10.0.0.2",
            "--nproc-per-node",
            "8",
            "--max-repeats",
            "-1",
            "--",
            "hf_action_restartable=running",
            "--lr",
            "0.1",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.hosts, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(args.nproc_per_node, 8);
        assert_eq!(args.max_repeats, -1);
        assert_eq!(args.rest, vec!["hf_action_restartable=running", "--lr", "0.1"]);
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/invoker-states"));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "invoker",
            "fetch",
            "--project-name",
            "proj",
            "--state-dir",
            "/var/lib/invoker",
            "--runtime-timeout-secs",
            "5",
        ])
        .unwrap();

        let config = cli.invoker_config();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/invoker"));
        assert_eq!(config.runtime.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_restart_config() {
        let cli = Cli::try_parse_from([
            "invoker",
            "restart",
            "--project-name",
            "proj",
            "--hosts",
            "a,b",
            "--remote-shell",
            "rsh",
        ])
        .unwrap();

        let config = cli.invoker_config();
        assert_eq!(config.remote.shell, "rsh");
        assert_eq!(config.remote.invoker_exec, "invoker");
    }
}
