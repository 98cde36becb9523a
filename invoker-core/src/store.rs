//! Durable per-host record of each job's desired state and launch config.
//!
//! One file per job, named `<project>.<experiment>.<state>` with `state` one
//! of `running` / `stoppable`. The body is the JSON-encoded `JobConfig`.
//!
//! The store is rewritten as a whole on every flush: recognized state files
//! are deleted, then every in-memory entry is written back. There is no
//! locking; only one coordinating process per host may use a directory.

use crate::types::{DesiredState, JobConfig, JobKey};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default directory holding the state files
pub const DEFAULT_STATE_DIR: &str = "/tmp/invoker-states";

const TMP_SUFFIX: &str = ".tmp";

#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("state store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode state file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state for {key}: {source}")]
    Encode {
        key: JobKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("state for project {} experiment {} not found", .0.project, .0.experiment)]
    NotFound(JobKey),
}

impl StateStoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StateStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// The unit persisted per job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedJobState {
    pub key: JobKey,
    pub state: DesiredState,
    pub config: JobConfig,
}

impl PersistedJobState {
    pub fn file_name(&self) -> String {
        state_file_name(&self.key, self.state)
    }
}

/// `<project>.<experiment>.<state>`
pub fn state_file_name(key: &JobKey, state: DesiredState) -> String {
    format!("{}.{}.{}", key.project, key.experiment, state)
}

/// Parse a file name under the three-token grammar
pub fn parse_state_file_name(name: &str) -> Option<(JobKey, DesiredState)> {
    let mut parts = name.split('.');
    let (project, experiment, state) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || project.is_empty() || experiment.is_empty() {
        return None;
    }

    let state = state.parse::<DesiredState>().ok()?;
    Some((JobKey::new(project, experiment), state))
}

/// Per-host job state, loaded from and flushed to one directory
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    entries: BTreeMap<JobKey, PersistedJobState>,
}

impl StateStore {
    /// Open with no entries, creating `dir` if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StateStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StateStoreError::io(&dir, e))?;

        Ok(Self {
            dir,
            entries: BTreeMap::new(),
        })
    }

    /// Open and load every recognized state file
    pub fn open_and_load(dir: impl Into<PathBuf>) -> Result<Self, StateStoreError> {
        let mut store = Self::open(dir)?;
        store.load()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read every state file in the directory into memory
    ///
    /// Unrecognized names are skipped. A body that does not decode fails the
    /// whole load and leaves the in-memory entries untouched.
    pub fn load(&mut self) -> Result<(), StateStoreError> {
        let mut loaded = BTreeMap::new();

        for (path, key, state) in self.recognized_files()? {
            let data = fs::read(&path).map_err(|e| StateStoreError::io(&path, e))?;
            let config: JobConfig = serde_json::from_slice(&data)
                .map_err(|source| StateStoreError::Decode { path: path.clone(), source })?;

            if config.key() != key {
                warn!(
                    "Store: {} holds config for {}, keeping file name key",
                    path.display(),
                    config.key()
                );
            }

            loaded.insert(key.clone(), PersistedJobState { key, state, config });
        }

        info!("Store: Loaded {} job states from {}", loaded.len(), self.dir.display());
        self.entries = loaded;
        Ok(())
    }

    pub fn get(&self, key: &JobKey) -> Result<&PersistedJobState, StateStoreError> {
        self.entries
            .get(key)
            .ok_or_else(|| StateStoreError::NotFound(key.clone()))
    }

    /// Insert or replace; nothing reaches disk until `flush`
    pub fn set(&mut self, key: JobKey, state: DesiredState, config: JobConfig) {
        debug!("Store: Set {} -> {}", key, state);
        self.entries
            .insert(key.clone(), PersistedJobState { key, state, config });
    }

    /// Drop an entry from memory; the next flush removes its file
    pub fn remove(&mut self, key: &JobKey) -> Option<PersistedJobState> {
        self.entries.remove(key)
    }

    /// Entries in key order
    pub fn entries(&self) -> impl Iterator<Item = &PersistedJobState> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrite the directory from the in-memory entries
    pub fn flush(&self) -> Result<(), StateStoreError> {
        // Encode before touching disk so an encode failure changes nothing
        let mut encoded = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values() {
            let body = serde_json::to_vec(&entry.config).map_err(|source| {
                StateStoreError::Encode {
                    key: entry.key.clone(),
                    source,
                }
            })?;
            encoded.push((entry.file_name(), body));
        }

        for (path, _, _) in self.recognized_files()? {
            fs::remove_file(&path).map_err(|e| StateStoreError::io(&path, e))?;
        }
        for path in self.stale_tmp_files()? {
            warn!("Store: Removing leftover {}", path.display());
            fs::remove_file(&path).map_err(|e| StateStoreError::io(&path, e))?;
        }

        for (name, body) in &encoded {
            let path = self.dir.join(name);
            let tmp = self.dir.join(format!("{}{}", name, TMP_SUFFIX));
            fs::write(&tmp, body).map_err(|e| StateStoreError::io(&tmp, e))?;
            fs::rename(&tmp, &path).map_err(|e| StateStoreError::io(&path, e))?;
        }

        info!("Store: Flushed {} job states to {}", encoded.len(), self.dir.display());
        Ok(())
    }

    fn recognized_files(&self) -> Result<Vec<(PathBuf, JobKey, DesiredState)>, StateStoreError> {
        let read_dir = fs::read_dir(&self.dir).map_err(|e| StateStoreError::io(&self.dir, e))?;
        let mut files = Vec::new();

        for entry in read_dir {
            let entry = entry.map_err(|e| StateStoreError::io(&self.dir, e))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| StateStoreError::io(&path, e))?;
            if file_type.is_dir() {
                continue;
            }

            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match parse_state_file_name(name) {
                Some((key, state)) => files.push((path, key, state)),
                None => debug!("Store: Skipping {}", name),
            }
        }

        files.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(files)
    }

    /// `.tmp` files of recognized names left by an interrupted flush
    fn stale_tmp_files(&self) -> Result<Vec<PathBuf>, StateStoreError> {
        let read_dir = fs::read_dir(&self.dir).map_err(|e| StateStoreError::io(&self.dir, e))?;
        let mut stale = Vec::new();

        for entry in read_dir {
            let entry = entry.map_err(|e| StateStoreError::io(&self.dir, e))?;
            let name = entry.file_name();
            let is_stale = name
                .to_str()
                .and_then(|n| n.strip_suffix(TMP_SUFFIX))
                .is_some_and(|stem| parse_state_file_name(stem).is_some());
            if is_stale && !entry.path().is_dir() {
                stale.push(entry.path());
            }
        }
        Ok(stale)
    }
}
