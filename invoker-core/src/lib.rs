//! Invoker Core Library
//!
//! Launches multi-node training jobs and decides, from independent per-host
//! observations, which of them must be restarted. Each host picks its own
//! rank from a shared host list and keeps its belief about a job's desired
//! state in a local store. Observed exit codes are reconciled fleet-wide.

pub mod types;
pub mod restart;
pub mod addrs;
pub mod rank;
pub mod store;
pub mod runtime;
pub mod reconcile;
pub mod exchange;
pub mod launch;
pub mod config;

pub use types::*;
pub use addrs::NodeAddresses;
pub use config::InvokerConfig;
pub use exchange::{MemoryExchange, PageExchange, RemoteExchange};
pub use rank::{resolve_role, Role};
pub use reconcile::{Decision, LocalPage, Reconciler, RestartSet};
pub use runtime::{ContainerRuntime, DockerCli, MemoryRuntime};
pub use store::StateStore;
