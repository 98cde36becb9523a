//! Transport of local pages between hosts
//!
//! The reconciler never talks to other hosts itself. A `PageExchange` is
//! handed in: each host sends its page, and the coordinating host receives
//! the pages of its peers.

use crate::reconcile::LocalPage;
use crate::types::Host;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info};

/// Default bound on fetching one remote page
pub const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("failed to encode page: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("host {host} sent an invalid page: {source}")]
    Decode {
        host: Host,
        #[source]
        source: serde_json::Error,
    },

    #[error("host {host} did not answer within {after:?}")]
    Timeout { host: Host, after: Duration },

    #[error("fetching page from {host} failed: {stderr}")]
    CommandFailed { host: Host, stderr: String },

    #[error("expected {expected} pages, channel closed after {received}")]
    Closed { expected: usize, received: usize },

    #[error("asked for {requested} pages but only {available} hosts are configured")]
    NotEnoughHosts { requested: usize, available: usize },

    #[error("exchange I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Injected page transport
pub trait PageExchange {
    /// Publish this host's page
    fn send_local(&self, page: &LocalPage) -> impl Future<Output = Result<(), ExchangeError>> + Send;

    /// Collect `n` pages from peers
    fn receive_peers(
        &self,
        n: usize,
    ) -> impl Future<Output = Result<Vec<LocalPage>, ExchangeError>> + Send;
}

/// Channel-backed exchange for in-process fleets
pub struct MemoryExchange {
    tx: mpsc::Sender<LocalPage>,
    rx: Mutex<mpsc::Receiver<LocalPage>>,
}

impl MemoryExchange {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Sender a simulated peer can publish through
    pub fn sender(&self) -> mpsc::Sender<LocalPage> {
        self.tx.clone()
    }
}

impl PageExchange for MemoryExchange {
    async fn send_local(&self, page: &LocalPage) -> Result<(), ExchangeError> {
        self.tx
            .send(page.clone())
            .await
            .map_err(|_| ExchangeError::Closed {
                expected: 1,
                received: 0,
            })
    }

    async fn receive_peers(&self, n: usize) -> Result<Vec<LocalPage>, ExchangeError> {
        let mut rx = self.rx.lock().await;
        let mut pages = Vec::with_capacity(n);
        while pages.len() < n {
            match rx.recv().await {
                Some(page) => pages.push(page),
                None => {
                    return Err(ExchangeError::Closed {
                        expected: n,
                        received: pages.len(),
                    })
                }
            }
        }
        Ok(pages)
    }
}

/// Exchange over a remote shell
///
/// Sending prints the page on stdout. Receiving runs
/// `<shell> <host> <invoker> fetch ...` on each peer and reads that stdout.
#[derive(Debug, Clone)]
pub struct RemoteExchange {
    pub shell: String,
    pub invoker_exec: String,
    pub hosts: Vec<Host>,
    /// Extra arguments appended to the remote `fetch` command
    pub fetch_args: Vec<String>,
    pub timeout: Duration,
}

impl RemoteExchange {
    pub fn new(shell: impl Into<String>, invoker_exec: impl Into<String>, hosts: Vec<Host>) -> Self {
        Self {
            shell: shell.into(),
            invoker_exec: invoker_exec.into(),
            hosts,
            fetch_args: Vec::new(),
            timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }

    pub fn with_fetch_args(mut self, args: Vec<String>) -> Self {
        self.fetch_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line run through the shell for `host`
    pub fn fetch_command(&self, host: &str) -> Vec<String> {
        let mut args = vec![host.to_string(), self.invoker_exec.clone(), "fetch".to_string()];
        args.extend(self.fetch_args.iter().cloned());
        args
    }

    async fn fetch_one(&self, host: &str) -> Result<LocalPage, ExchangeError> {
        let args = self.fetch_command(host);
        debug!("Exchange: {} {}", self.shell, args.join(" "));

        let mut cmd = Command::new(&self.shell);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ExchangeError::Timeout {
                    host: host.to_string(),
                    after: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(ExchangeError::CommandFailed {
                host: host.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // Logging may share stdout; the page is the last non-empty line
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        LocalPage::from_json(line).map_err(|source| ExchangeError::Decode {
            host: host.to_string(),
            source,
        })
    }
}

impl PageExchange for RemoteExchange {
    async fn send_local(&self, page: &LocalPage) -> Result<(), ExchangeError> {
        let json = page.to_json().map_err(ExchangeError::Encode)?;
        println!("{}", json);
        Ok(())
    }

    async fn receive_peers(&self, n: usize) -> Result<Vec<LocalPage>, ExchangeError> {
        if n > self.hosts.len() {
            return Err(ExchangeError::NotEnoughHosts {
                requested: n,
                available: self.hosts.len(),
            });
        }

        let mut pages = Vec::with_capacity(n);
        for host in &self.hosts[..n] {
            let page = self.fetch_one(host).await?;
            info!("Exchange: Received page from {}", host);
            pages.push(page);
        }
        Ok(pages)
    }
}
