//! Restart reconciliation across the fleet
//!
//! Every host produces a `LocalPage` with its own observation of each job it
//! takes part in. One coordinating host gathers all pages, merges them and
//! decides which jobs to relaunch:
//!
//! 1. Merge pages into one `host -> job -> observation` table (later wins)
//! 2. Group observations by job
//! 3. Reject a job whose hosts disagree on its config (other jobs continue)
//! 4. Restart the whole job if any host's observation needs a restart
//!
//! Host-set changes between launch and reconciliation are not handled: a
//! host dropped from a job's list simply stops reporting on it.

use crate::addrs::NodeAddresses;
use crate::restart::NOT_FOUND_EXIT_CODE;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::store::{StateStore, StateStoreError};
use crate::types::{Host, JobConfig, JobKey, StateMatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Jobs the launcher must relaunch, with the config to relaunch them with
pub type RestartSet = BTreeMap<JobKey, JobConfig>;

/// Errors that abort a whole reconciliation pass
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Store: {0}")]
    Store(#[from] StateStoreError),

    #[error("Runtime query for {job} failed: {source}")]
    Runtime {
        job: JobKey,
        #[source]
        source: RuntimeError,
    },

    #[error("Invalid page: {0}")]
    Page(#[from] serde_json::Error),
}

/// Two hosts disagree on a job's config; only that job is dropped
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("hosts {reference_host} and {conflicting_host} report different configs for {key}")]
pub struct ReconciliationConflict {
    pub key: JobKey,
    pub reference_host: Host,
    pub conflicting_host: Host,
}

/// Observations keyed by host, then by job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalPage(pub BTreeMap<Host, BTreeMap<JobKey, StateMatch>>);

impl LocalPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page holding one (possibly empty) host entry
    pub fn for_host(host: impl Into<Host>) -> Self {
        let mut page = Self::new();
        page.0.insert(host.into(), BTreeMap::new());
        page
    }

    pub fn insert(&mut self, host: impl Into<Host>, key: JobKey, observed: StateMatch) {
        self.0.entry(host.into()).or_default().insert(key, observed);
    }

    pub fn get(&self, host: &str, key: &JobKey) -> Option<&StateMatch> {
        self.0.get(host).and_then(|jobs| jobs.get(key))
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|jobs| jobs.is_empty())
    }

    /// Copy every cell of `other` in, replacing duplicates
    pub fn absorb(&mut self, other: LocalPage) {
        for (host, jobs) in other.0 {
            let target = self.0.entry(host).or_default();
            for (key, observed) in jobs {
                target.insert(key, observed);
            }
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Observations grouped by job, hosts in order
    fn by_job(&self) -> BTreeMap<&JobKey, Vec<(&Host, &StateMatch)>> {
        let mut grouped: BTreeMap<&JobKey, Vec<(&Host, &StateMatch)>> = BTreeMap::new();
        for (host, jobs) in &self.0 {
            for (key, observed) in jobs {
                grouped.entry(key).or_default().push((host, observed));
            }
        }
        grouped
    }
}

/// Outcome of one merge-and-decide pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    pub restart: RestartSet,
    pub conflicts: Vec<ReconciliationConflict>,
}

impl Decision {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Observe every stored job this node takes part in
///
/// A missing container counts as exit code 1. Any other runtime failure,
/// including a timeout, aborts the pass: an unknown state is never reported
/// as dead.
pub async fn produce_local_page<R: ContainerRuntime>(
    store: &StateStore,
    runtime: &R,
    addrs: &NodeAddresses,
    project: Option<&str>,
) -> Result<LocalPage, ReconcileError> {
    let mut page = LocalPage::for_host(addrs.public.clone());

    for entry in store.entries() {
        let config = &entry.config;
        if project.is_some_and(|p| p != entry.key.project) {
            continue;
        }
        // Keyed by the host-list entry naming this node, not its public address
        let reporter = if config.is_single_node() {
            addrs.public.clone()
        } else {
            match addrs.position_in(&config.hosts) {
                Some(idx) => config.hosts[idx].clone(),
                None => {
                    debug!("Reconciler: {} does not run here, skipping", entry.key);
                    continue;
                }
            }
        };

        let container = config.container_name();
        let actual = match runtime.status_by_name(&container).await {
            Ok(status) => status.exit_code,
            Err(RuntimeError::NotFound(_)) => {
                warn!("Reconciler: Container {} not found, counting as failed", container);
                NOT_FOUND_EXIT_CODE
            }
            Err(source) => {
                return Err(ReconcileError::Runtime {
                    job: entry.key.clone(),
                    source,
                })
            }
        };

        debug!("Reconciler: {} exit code {}", entry.key, actual);
        page.insert(
            reporter,
            entry.key.clone(),
            StateMatch {
                expected: config.desired_state(),
                actual,
                config: config.clone(),
            },
        );
    }

    Ok(page)
}

/// Merge pages in order; a later page wins on a duplicate host/job cell
pub fn merge_pages(pages: impl IntoIterator<Item = LocalPage>) -> LocalPage {
    let mut merged = LocalPage::new();
    for page in pages {
        merged.absorb(page);
    }
    merged
}

/// Compute the restart set of a merged page
pub fn decide(page: &LocalPage) -> Decision {
    let mut decision = Decision::default();

    for (key, observations) in page.by_job() {
        let Some(&(reference_host, reference)) = observations.first() else {
            continue;
        };

        let conflict = observations
            .iter()
            .find(|(_, observed)| !reference.config.same_launch(&observed.config));
        if let Some(&(conflicting_host, _)) = conflict {
            let conflict = ReconciliationConflict {
                key: key.clone(),
                reference_host: reference_host.clone(),
                conflicting_host: conflicting_host.clone(),
            };
            warn!("Reconciler: {}", conflict);
            decision.conflicts.push(conflict);
            continue;
        }

        let failed: Vec<&Host> = observations
            .iter()
            .filter(|(_, observed)| observed.needs_restart())
            .map(|(host, _)| *host)
            .collect();

        if !failed.is_empty() {
            info!("Reconciler: Failed hosts for {}: {:?}", key, failed);
            decision.restart.insert(key.clone(), reference.config.clone());
        }
    }

    info!(
        "Reconciler: {} jobs to restart, {} conflicts",
        decision.restart.len(),
        decision.conflicts.len()
    );
    decision
}

/// Owned state of one reconciliation pass on the coordinating host
#[derive(Debug, Default)]
pub struct Reconciler {
    page: LocalPage,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, page: LocalPage) {
        self.page.absorb(page);
    }

    /// Absorb a page received as JSON text
    pub fn absorb_json(&mut self, data: &str) -> Result<(), ReconcileError> {
        self.absorb(LocalPage::from_json(data)?);
        Ok(())
    }

    pub fn page(&self) -> &LocalPage {
        &self.page
    }

    pub fn decide(&self) -> Decision {
        decide(&self.page)
    }
}
