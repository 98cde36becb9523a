//! Property tests for the invoker core
//!
//! Invariants covered:
//! - Config equality: structural, any single field change breaks it
//! - Rank resolution: first matching index, or no role at all
//! - Restart predicate: only running jobs outside the OK codes restart
//! - State store: round-trip through disk, idempotent flush

use invoker_core::addrs::NodeAddresses;
use invoker_core::rank::{resolve_role, RankError, Role};
use invoker_core::restart::needs_restart;
use invoker_core::store::StateStore;
use invoker_core::types::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ============================================================================
// Strategies
// ============================================================================

fn name() -> impl Strategy<Value = String> {
    "[a-z_][a-z0-9_-]{0,8}"
}

fn host() -> impl Strategy<Value = Host> {
    (0u8..4, 1u8..255).prop_map(|(c, d)| format!("10.0.{}.{}", c, d))
}

fn hosts() -> impl Strategy<Value = Vec<Host>> {
    prop::collection::vec(host(), 1..6)
}

fn optional_name() -> impl Strategy<Value = Option<String>> {
    prop::option::of(name())
}

fn job_config() -> impl Strategy<Value = JobConfig> {
    (
        name(),
        name(),
        name(),
        hosts(),
        1u32..16,
        1u16..u16::MAX,
        -1i64..100,
        prop::collection::vec("[a-z_=]{1,12}", 0..4),
        optional_name(),
        prop::option::of(host()),
        optional_name(),
    )
        .prop_map(
            |(project, experiment, run, hosts, nproc, port, repeats, rest, container, master, no_python)| {
                JobConfig {
                    project_name: project,
                    hosts,
                    nproc_per_node: nproc,
                    experiment_name: experiment,
                    port,
                    run_name: run,
                    max_repeats: repeats,
                    rest,
                    container_name: container,
                    master_host: master,
                    no_python,
                }
            },
        )
}

fn desired_state() -> impl Strategy<Value = DesiredState> {
    prop_oneof![Just(DesiredState::Running), Just(DesiredState::Stoppable)]
}

/// Change exactly one field of `cfg`
fn flip_field(cfg: &mut JobConfig, field: usize) {
    match field {
        0 => cfg.project_name.push('x'),
        1 => cfg.hosts.push("10.9.9.9".to_string()),
        2 => cfg.nproc_per_node += 1,
        3 => cfg.experiment_name.push('x'),
        4 => cfg.port = cfg.port.wrapping_add(1).max(1),
        5 => cfg.run_name.push('x'),
        6 => cfg.max_repeats += 1,
        7 => cfg.rest.push("--extra".to_string()),
        8 => cfg.container_name = cfg.container_name.take().map_or(Some(String::new()), |_| None),
        9 => cfg.master_host = cfg.master_host.take().map_or(Some(String::new()), |_| None),
        _ => cfg.no_python = cfg.no_python.take().map_or(Some(String::new()), |_| None),
    }
}

fn dir_snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .map(|e| (e.file_name().to_string_lossy().into_owned(), fs::read(e.path()).unwrap()))
        .collect()
}

// ============================================================================
// Config Equality Property Tests
// ============================================================================

proptest! {
    #[test]
    fn config_equals_its_clone(cfg in job_config()) {
        prop_assert!(cfg.same_launch(&cfg.clone()));
    }

    /// Any single field change breaks equality, in both directions
    #[test]
    fn single_field_change_breaks_equality(cfg in job_config(), field in 0usize..11) {
        let mut other = cfg.clone();
        flip_field(&mut other, field);
        prop_assert!(!cfg.same_launch(&other), "field {} did not affect equality", field);
        prop_assert!(!other.same_launch(&cfg));
    }

    #[test]
    fn reordering_hosts_breaks_equality(cfg in job_config()) {
        let mut other = cfg.clone();
        other.hosts.reverse();
        prop_assert_eq!(cfg.same_launch(&other), cfg.hosts == other.hosts);
    }

    #[test]
    fn config_survives_json(cfg in job_config()) {
        let json = serde_json::to_string(&cfg).unwrap();
        let back: JobConfig = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, cfg);
    }
}

// ============================================================================
// Rank Resolution Property Tests
// ============================================================================

proptest! {
    /// Rank is the first index holding any node address
    #[test]
    fn rank_is_first_match(hosts in hosts(), pick in any::<prop::sample::Index>()) {
        let me = hosts[pick.index(hosts.len())].clone();
        let addrs = NodeAddresses::new(me.clone(), vec!["172.16.0.1".to_string()]);

        let role = resolve_role(&hosts, None, &addrs).unwrap();
        let expected = hosts.iter().position(|h| *h == me).unwrap();
        prop_assert_eq!(role.rank(), expected);
        prop_assert_eq!(role.world_size(), hosts.len());
        prop_assert_eq!(role.master(), Some(hosts[0].as_str()));
    }

    /// A local interface address counts like the public one
    #[test]
    fn rank_matches_local_address(hosts in hosts(), pick in any::<prop::sample::Index>()) {
        let me = hosts[pick.index(hosts.len())].clone();
        let addrs = NodeAddresses::new("203.0.113.7", vec!["172.16.0.1".to_string(), me.clone()]);

        let role = resolve_role(&hosts, None, &addrs).unwrap();
        prop_assert_eq!(role.rank(), hosts.iter().position(|h| *h == me).unwrap());
    }

    #[test]
    fn unknown_node_gets_no_role(hosts in hosts()) {
        let addrs = NodeAddresses::new("203.0.113.7", vec![]);
        let result = resolve_role(&hosts, None, &addrs);
        prop_assert!(
            matches!(result, Err(RankError::HostNotInList { .. })),
            "expected HostNotInList"
        );
    }

    #[test]
    fn master_override_wins(hosts in hosts(), master in host()) {
        let addrs = NodeAddresses::new(hosts[0].clone(), vec![]);
        let role = resolve_role(&hosts, Some(&master), &addrs).unwrap();
        prop_assert_eq!(role.master(), Some(master.as_str()));
    }

    /// `["localhost"]` is single-node regardless of addresses
    #[test]
    fn localhost_is_single_node(public in host(), local in prop::collection::vec(host(), 0..3)) {
        let addrs = NodeAddresses::new(public, local);
        let role = resolve_role(&[LOCALHOST.to_string()], None, &addrs).unwrap();
        prop_assert_eq!(role, Role::SingleNode);
    }
}

// ============================================================================
// Restart Predicate Property Tests
// ============================================================================

proptest! {
    #[test]
    fn stoppable_never_restarts(actual in any::<i64>()) {
        prop_assert!(!needs_restart(DesiredState::Stoppable, actual));
    }

    #[test]
    fn running_restarts_outside_ok_codes(actual in any::<i64>()) {
        let ok = actual == 0 || actual == 137;
        prop_assert_eq!(needs_restart(DesiredState::Running, actual), !ok);
    }

    #[test]
    fn restart_intent_comes_from_rest(mut cfg in job_config(), running in any::<bool>()) {
        cfg.rest.retain(|a| !a.starts_with(RESTARTABLE_ARG));
        if running {
            cfg.rest.push(format!("{}=running", RESTARTABLE_ARG));
        }
        let expected = if running { DesiredState::Running } else { DesiredState::Stoppable };
        prop_assert_eq!(cfg.desired_state(), expected);
    }
}

// ============================================================================
// State Store Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn store_round_trip(
        jobs in prop::collection::vec((job_config(), desired_state()), 0..6)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        let mut expected = BTreeMap::new();
        for (cfg, state) in jobs {
            store.set(cfg.key(), state, cfg.clone());
            expected.insert(cfg.key(), (state, cfg));
        }
        store.flush().unwrap();

        let reloaded = StateStore::open_and_load(dir.path()).unwrap();
        prop_assert_eq!(reloaded.len(), expected.len());
        for entry in reloaded.entries() {
            let (state, cfg) = &expected[&entry.key];
            prop_assert_eq!(entry.state, *state);
            prop_assert_eq!(&entry.config, cfg);
        }
    }

    /// Two flushes of the same state leave byte-identical directories
    #[test]
    fn flush_is_idempotent(
        jobs in prop::collection::vec((job_config(), desired_state()), 0..6)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StateStore::open(dir.path()).unwrap();
        for (cfg, state) in jobs {
            store.set(cfg.key(), state, cfg);
        }

        store.flush().unwrap();
        let first = dir_snapshot(dir.path());
        store.flush().unwrap();
        prop_assert_eq!(dir_snapshot(dir.path()), first);
    }

    /// Names that do not split into three tokens are never loaded
    #[test]
    fn malformed_names_are_skipped(stray in "[a-z]{1,6}(\\.[a-z]{1,6}){0,1}|[a-z]{1,4}(\\.[a-z]{1,4}){3,4}") {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(&stray), b"not json").unwrap();

        let store = StateStore::open_and_load(dir.path()).unwrap();
        prop_assert!(store.is_empty());
    }
}
