//! Role selection of a node within a job's host list

use crate::addrs::NodeAddresses;
use crate::types::{Host, LOCALHOST};
use std::net::{Ipv4Addr, TcpListener};
use thiserror::Error;
use tracing::{debug, info};

/// Role of this node in a distributed job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// `["localhost"]` job: no distributed setup, rank 0
    SingleNode,
    Distributed {
        master: Host,
        rank: usize,
        world_size: usize,
    },
}

impl Role {
    pub fn rank(&self) -> usize {
        match self {
            Role::SingleNode => 0,
            Role::Distributed { rank, .. } => *rank,
        }
    }

    pub fn world_size(&self) -> usize {
        match self {
            Role::SingleNode => 1,
            Role::Distributed { world_size, .. } => *world_size,
        }
    }

    /// Master address, `None` for single-node jobs
    pub fn master(&self) -> Option<&str> {
        match self {
            Role::SingleNode => None,
            Role::Distributed { master, .. } => Some(master),
        }
    }

    pub fn is_master(&self) -> bool {
        self.rank() == 0
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RankError {
    /// Not a failure: the caller must exit successfully without doing anything
    #[error("none of {addresses:?} is in the hosts list, omitting")]
    HostNotInList { addresses: Vec<Host> },

    #[error("hosts list is empty")]
    EmptyHosts,

    #[error("port {port} is already in use: {reason}")]
    PortInUse { port: u16, reason: String },
}

/// Pick this node's rank from `hosts`
///
/// Rank is the index of the first entry matching any node address.
pub fn resolve_role(
    hosts: &[Host],
    master_override: Option<&str>,
    addrs: &NodeAddresses,
) -> Result<Role, RankError> {
    if hosts.len() == 1 && hosts[0] == LOCALHOST {
        debug!("Rank: single-node job");
        return Ok(Role::SingleNode);
    }

    let first = hosts.first().ok_or(RankError::EmptyHosts)?;

    let rank = addrs
        .position_in(hosts)
        .ok_or_else(|| RankError::HostNotInList {
            addresses: addrs.iter().map(str::to_string).collect(),
        })?;

    let master = match master_override {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => first.clone(),
    };

    info!("Rank: {} of {} (master {})", rank, hosts.len(), master);
    Ok(Role::Distributed {
        master,
        rank,
        world_size: hosts.len(),
    })
}

/// Bind and release the master port, failing if someone else holds it
pub fn ensure_port_available(port: u16) -> Result<(), RankError> {
    match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) => Err(RankError::PortInUse {
            port,
            reason: e.to_string(),
        }),
    }
}

/// Check the master port on the rank-0 node, single-node jobs included
pub fn ensure_role_port(role: &Role, port: u16) -> Result<(), RankError> {
    if role.is_master() {
        ensure_port_available(port)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(list: &[&str]) -> Vec<Host> {
        list.iter().map(|h| h.to_string()).collect()
    }

    fn addrs(public: &str, local: &[&str]) -> NodeAddresses {
        NodeAddresses::new(public, hosts(local))
    }

    #[test]
    fn test_localhost_sentinel() {
        let role = resolve_role(&hosts(&["localhost"]), None, &addrs("1.2.3.4", &[])).unwrap();
        assert_eq!(role, Role::SingleNode);
        assert_eq!(role.rank(), 0);
        assert_eq!(role.master(), None);
    }

    #[test]
    fn test_rank_from_local_address() {
        let list = hosts(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let role = resolve_role(&list, None, &addrs("34.0.0.1", &["10.0.0.3"])).unwrap();
        assert_eq!(
            role,
            Role::Distributed {
                master: "10.0.0.1".to_string(),
                rank: 2,
                world_size: 3,
            }
        );
    }

    #[test]
    fn test_first_match_wins() {
        let list = hosts(&["10.0.0.1", "34.0.0.1", "10.0.0.2"]);
        let role = resolve_role(&list, None, &addrs("34.0.0.1", &["10.0.0.2"])).unwrap();
        assert_eq!(role.rank(), 1);
    }

    #[test]
    fn test_master_override() {
        let list = hosts(&["10.0.0.1", "10.0.0.2"]);
        let role = resolve_role(&list, Some("10.0.0.9"), &addrs("10.0.0.2", &[])).unwrap();
        assert_eq!(role.master(), Some("10.0.0.9"));

        let role = resolve_role(&list, Some(""), &addrs("10.0.0.2", &[])).unwrap();
        assert_eq!(role.master(), Some("10.0.0.1"));
    }

    #[test]
    fn test_host_not_in_list() {
        let list = hosts(&["10.0.0.1", "10.0.0.2"]);
        let err = resolve_role(&list, None, &addrs("34.0.0.1", &["192.168.1.5"])).unwrap_err();
        assert!(matches!(err, RankError::HostNotInList { .. }));
    }

    #[test]
    fn test_empty_hosts() {
        assert_eq!(
            resolve_role(&[], None, &addrs("1.2.3.4", &[])),
            Err(RankError::EmptyHosts)
        );
    }

    #[test]
    fn test_port_in_use() {
        let holder = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = holder.local_addr().unwrap().port();
        assert!(matches!(
            ensure_port_available(port),
            Err(RankError::PortInUse { .. })
        ));
        drop(holder);
        assert!(ensure_port_available(port).is_ok());
    }

    #[test]
    fn test_rank_zero_checks_port() {
        let holder = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
        let port = holder.local_addr().unwrap().port();

        assert!(matches!(
            ensure_role_port(&Role::SingleNode, port),
            Err(RankError::PortInUse { .. })
        ));
        let master = Role::Distributed {
            master: "10.0.0.1".to_string(),
            rank: 0,
            world_size: 2,
        };
        assert!(ensure_role_port(&master, port).is_err());

        let worker = Role::Distributed {
            master: "10.0.0.1".to_string(),
            rank: 1,
            world_size: 2,
        };
        assert!(ensure_role_port(&worker, port).is_ok());
    }
}
