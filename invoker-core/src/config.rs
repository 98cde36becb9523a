//! Configuration for the invoker
//!
//! Combines settings for the container runtime, the local state store and
//! remote page fetching.

use crate::addrs::DEFAULT_PUBLIC_IP_URL;
use crate::exchange::DEFAULT_REMOTE_TIMEOUT;
use crate::launch::DEFAULT_IMAGE_TAG;
use crate::runtime::{DockerCli, DEFAULT_RUNTIME_TIMEOUT};
use crate::store::DEFAULT_STATE_DIR;
use std::path::PathBuf;
use std::time::Duration;

/// Complete invoker configuration
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Directory holding persisted job states
    pub state_dir: PathBuf,

    /// Tag of the training image built on launch
    pub image_tag: String,

    /// Endpoint answering with this node's public IP
    pub public_ip_url: String,

    pub runtime: RuntimeConfig,

    pub remote: RemoteConfig,
}

/// Container runtime settings
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Docker CLI binary
    pub docker_bin: String,

    /// Bound on each runtime query
    pub timeout: Duration,
}

/// Remote fetch settings for the coordinating host
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Remote shell, invoked as `<shell> <host> <command...>`
    pub shell: String,

    /// Invoker binary on remote hosts
    pub invoker_exec: String,

    /// Bound on each remote command
    pub timeout: Duration,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
            public_ip_url: DEFAULT_PUBLIC_IP_URL.to_string(),
            runtime: RuntimeConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            timeout: DEFAULT_RUNTIME_TIMEOUT,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            shell: "ssh".to_string(),
            invoker_exec: "invoker".to_string(),
            timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

impl InvokerConfig {
    /// Set state directory
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Set image tag
    pub fn with_image_tag(mut self, tag: impl Into<String>) -> Self {
        self.image_tag = tag.into();
        self
    }

    /// Set public IP endpoint
    pub fn with_public_ip_url(mut self, url: impl Into<String>) -> Self {
        self.public_ip_url = url.into();
        self
    }

    /// Set docker binary
    pub fn with_docker_bin(mut self, bin: impl Into<String>) -> Self {
        self.runtime.docker_bin = bin.into();
        self
    }

    /// Set runtime query timeout
    pub fn with_runtime_timeout(mut self, timeout: Duration) -> Self {
        self.runtime.timeout = timeout;
        self
    }

    /// Set remote shell and invoker binary
    pub fn with_remote(mut self, shell: impl Into<String>, invoker_exec: impl Into<String>) -> Self {
        self.remote.shell = shell.into();
        self.remote.invoker_exec = invoker_exec.into();
        self
    }

    /// Set remote command timeout
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote.timeout = timeout;
        self
    }

    /// Docker runtime built from these settings
    pub fn docker(&self) -> DockerCli {
        DockerCli::new(self.runtime.docker_bin.clone(), self.runtime.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = InvokerConfig::default();
        assert_eq!(config.state_dir, PathBuf::from("/tmp/invoker-states"));
        assert_eq!(config.image_tag, "hf-torch:latest");
        assert_eq!(config.runtime.docker_bin, "docker");
        assert_eq!(config.runtime.timeout, Duration::from_secs(30));
        assert_eq!(config.remote.shell, "ssh");
        assert_eq!(config.remote.invoker_exec, "invoker");
    }

    #[test]
    fn test_config_builder() {
        let config = InvokerConfig::default()
            .with_state_dir("/var/lib/invoker")
            .with_docker_bin("podman")
            .with_runtime_timeout(Duration::from_secs(5))
            .with_remote("rsh", "/opt/invoker")
            .with_public_ip_url("http://127.0.0.1:8080");

        assert_eq!(config.state_dir, PathBuf::from("/var/lib/invoker"));
        assert_eq!(config.runtime.docker_bin, "podman");
        assert_eq!(config.runtime.timeout, Duration::from_secs(5));
        assert_eq!(config.remote.shell, "rsh");
        assert_eq!(config.remote.invoker_exec, "/opt/invoker");
        assert_eq!(config.public_ip_url, "http://127.0.0.1:8080");
    }
}
