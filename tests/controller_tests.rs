// Copyright (c) 2025 - Cowboy AI, Inc.
//! Integration tests for the cluster controller
//!
//! These tests drive whole pipelines against the simulated provider and a
//! scripted executor that answers like a Docker Swarm:
//! 1. Create the minimum topology of a flavor
//! 2. Scale out and scale in
//! 3. Stop, start and delete the cluster
//!
//! Time is paused, so convergence polls and pipeline budgets elapse instantly.

mod fixtures;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use cim_provisioning::stack::Fault;
use cim_provisioning::state_machine::membership::MembershipState;
use cim_provisioning::{
    ClusterState, Complexity, Flavor, ProvisioningConfig, ProvisioningError, StackAdapter,
};
use cim_provisioning::errors::ErrorKind;

use fixtures::{fast_config, harness, harness_with, node_run_instances};

fn names(nodes: &[cim_provisioning::cluster::NodeRecord]) -> Vec<String> {
    nodes.iter().map(|n| n.name().to_string()).collect()
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_boh_small_cluster_becomes_nominal() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let cancel = CancellationToken::new();

    h.controller.create(&cancel).await.expect("create failed");

    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Nominal);
    let nodes = h.controller.list_nodes().await;
    assert_eq!(names(&nodes), vec!["alpha-master-1", "alpha-node-1"]);
    for node in &nodes {
        let path: Vec<&str> = node.history().iter().map(|t| t.to.name()).collect();
        assert_eq!(path, vec!["Provisioned", "Joining", "Member"]);
    }

    let gateway = h.controller.gateway().await.expect("gateway recorded");
    assert_eq!(gateway.name.as_str(), "gw-alpha");
    assert!(gateway.public_ip.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_bootstrap_scripts_are_uploaded_to_every_node() {
    let h = harness(Flavor::Swarm, Complexity::Small);
    h.controller.create(&CancellationToken::new()).await.unwrap();

    let copies = h.executor.copies();
    for node in ["alpha-master-1", "alpha-node-1"] {
        let uploaded: Vec<&str> = copies
            .iter()
            .filter(|(n, _)| n == node)
            .map(|(_, destination)| destination.as_str())
            .collect();
        assert!(uploaded.contains(&"/var/tmp/system_requirements.sh"), "{node}: {uploaded:?}");
    }
    assert!(copies
        .iter()
        .any(|(n, d)| n == "alpha-master-1" && d == "/var/tmp/install_master.sh"));
    assert!(copies
        .iter()
        .any(|(n, d)| n == "alpha-node-1" && d == "/var/tmp/install_node.sh"));
}

#[tokio::test(start_paused = true)]
async fn test_swarm_is_configured_once_after_every_host_exists() {
    let h = harness(Flavor::Swarm, Complexity::Normal);
    h.controller.create(&CancellationToken::new()).await.unwrap();

    assert_eq!(h.executor.hosts_at_configure(), Some(6));
    assert_eq!(h.executor.runs_matching("docker swarm init"), 1);
    assert_eq!(node_run_instances(&h.cloud), 6);
    assert_eq!(h.controller.list_master_ids().await.len(), 3);
    assert_eq!(h.controller.count_nodes(false).await, 3);

    for node in h.controller.list_nodes().await {
        assert_eq!(
            h.executor.swarm_status(node.name().as_str()).as_deref(),
            Some("Ready")
        );
    }
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Nominal);
}

#[tokio::test(start_paused = true)]
async fn test_transient_join_failures_are_retried() {
    let h = harness(Flavor::Swarm, Complexity::Small);
    h.executor.transient("docker swarm join --token", 2);

    h.controller.create(&CancellationToken::new()).await.unwrap();

    // leader joins by initialising; only the worker runs the join command
    assert_eq!(h.executor.runs_matching("docker swarm join --token"), 3);
    let node = h.controller.get_node("alpha-node-1").await.unwrap();
    assert_eq!(*node.state(), MembershipState::Member);
}

#[tokio::test(start_paused = true)]
async fn test_create_twice_is_rejected() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    let err = h.controller.create(&cancel).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::Precondition(_)));
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Nominal);
}

#[tokio::test(start_paused = true)]
async fn test_failed_host_is_rolled_back() {
    let h = harness(Flavor::Boh, Complexity::Small);
    h.cloud.fail_always(
        "instance_boot:alpha-node-1",
        Fault::Rejected("hardware fault".to_string()),
    );

    let err = h.controller.create(&CancellationToken::new()).await.unwrap_err();

    match &err {
        ProvisioningError::Node { node, source } => {
            assert_eq!(node, "alpha-node-1");
            assert!(matches!(**source, ProvisioningError::Composite { .. }), "{source}");
        }
        other => panic!("expected a node failure, got {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::FatalRemote);
    assert!(err.consequences().is_empty());
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Error);

    let lookup = h.stack.get_host_by_name("alpha-node-1").await.unwrap_err();
    assert!(lookup.is_not_found());
    let node = h.controller.get_node("alpha-node-1").await.unwrap();
    assert!(node.state().is_failed());
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_budget_reports_members() {
    let config = ProvisioningConfig {
        pipeline_timeout_secs: 30,
        member_timeout_secs: 300,
        ..fast_config()
    };
    let h = harness_with(Flavor::Swarm, Complexity::Small, config);
    h.executor.never_ready("alpha-node-1");

    let err = h.controller.create(&CancellationToken::new()).await.unwrap_err();

    match err {
        ProvisioningError::PartialTimeout {
            members,
            incomplete,
            ..
        } => {
            assert_eq!(members, vec!["alpha-master-1"]);
            assert_eq!(incomplete, vec!["alpha-node-1"]);
        }
        other => panic!("expected a partial timeout, got {other}"),
    }
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_pipeline_budget_without_members_counts_no_checks() {
    let config = ProvisioningConfig {
        pipeline_timeout_secs: 30,
        member_timeout_secs: 300,
        ..fast_config()
    };
    let h = harness_with(Flavor::Swarm, Complexity::Small, config);
    h.executor.fail("docker node ls", 1, "manager unreachable");

    let err = h.controller.create(&CancellationToken::new()).await.unwrap_err();

    match err {
        ProvisioningError::Timeout {
            operation,
            elapsed,
            attempts,
        } => {
            assert_eq!(operation, "create cluster");
            assert_eq!(attempts, 0);
            assert!(elapsed >= std::time::Duration::from_secs(30));
        }
        other => panic!("expected a timeout, got {other}"),
    }
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_create_fails() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.controller.create(&cancel).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Error);
}

// ============================================================================
// Scale-out / scale-in
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_add_nodes_continues_numbering() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    let added = h.controller.add_nodes(3, false, &cancel).await.unwrap();

    assert_eq!(added, vec!["alpha-node-2", "alpha-node-3", "alpha-node-4"]);
    assert_eq!(h.controller.count_nodes(false).await, 4);
    assert_eq!(h.controller.list_node_ips(false).await.len(), 4);
    for name in &added {
        assert!(h.controller.get_node(name).await.unwrap().is_member());
    }
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Nominal);
}

#[tokio::test(start_paused = true)]
async fn test_add_public_node_gets_public_address() {
    let h = harness(Flavor::Swarm, Complexity::Small);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    let name = h.controller.add_node(true, &cancel).await.unwrap();

    assert_eq!(name, "alpha-pubnode-1");
    let node = h.controller.get_node(&name).await.unwrap();
    assert!(node.host().unwrap().public_ip.is_some());
    assert_eq!(h.executor.swarm_status(&name).as_deref(), Some("Ready"));
    assert_eq!(h.controller.count_nodes(true).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_add_nodes_requires_created_cluster() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let err = h
        .controller
        .add_nodes(1, false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::Precondition(_)));
}

#[tokio::test(start_paused = true)]
async fn test_delete_last_node_removes_highest_index() {
    let h = harness(Flavor::Boh, Complexity::Normal);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    let removed = h.controller.delete_last_node(false, &cancel).await.unwrap();

    assert_eq!(removed, "alpha-node-3");
    assert!(!h.controller.search_node("alpha-node-3").await);
    assert_eq!(h.controller.count_nodes(false).await, 2);
    assert_eq!(h.cloud.call_count("terminate_instances"), 1);
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Nominal);
}

#[tokio::test(start_paused = true)]
async fn test_swarm_node_is_removed_from_swarm_before_host() {
    let h = harness(Flavor::Swarm, Complexity::Small);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    h.controller
        .delete_specific_node("alpha-node-1", &cancel)
        .await
        .unwrap();

    assert_eq!(h.executor.swarm_status("alpha-node-1"), None);
    let on_node = h.executor.commands_on("alpha-node-1");
    assert!(on_node.iter().any(|c| c == "docker swarm leave"));
    let on_leader = h.executor.commands_on("alpha-master-1");
    assert!(on_leader.iter().any(|c| c == "docker node rm alpha-node-1"));
    assert_eq!(h.cloud.call_count("terminate_instances"), 1);
    assert!(!h.controller.search_node("alpha-node-1").await);
}

#[tokio::test(start_paused = true)]
async fn test_failed_leave_keeps_host() {
    let h = harness(Flavor::Swarm, Complexity::Normal);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();
    h.executor
        .fail("docker swarm leave", 1, "Error response from daemon: context deadline exceeded");

    let err = h
        .controller
        .delete_specific_node("alpha-node-2", &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::Node { ref node, .. } if node == "alpha-node-2"));
    let node = h.controller.get_node("alpha-node-2").await.unwrap();
    assert_eq!(*node.state(), MembershipState::Leaving);
    assert_eq!(h.cloud.call_count("terminate_instances"), 0);

    // the same request succeeds once the node can leave
    h.executor.clear_failures();
    h.controller
        .delete_specific_node("alpha-node-2", &cancel)
        .await
        .unwrap();
    assert!(!h.controller.search_node("alpha-node-2").await);
    assert_eq!(h.cloud.call_count("terminate_instances"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_node_still_listed_after_removal_keeps_host() {
    let h = harness(Flavor::Swarm, Complexity::Normal);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();
    h.executor.keep_listed("alpha-node-1");

    let err = h
        .controller
        .delete_specific_node("alpha-node-1", &cancel)
        .await
        .unwrap_err();

    match &err {
        ProvisioningError::Node { node, source } => {
            assert_eq!(node, "alpha-node-1");
            assert!(matches!(**source, ProvisioningError::Timeout { .. }), "{source}");
        }
        other => panic!("expected a node failure, got {other}"),
    }
    assert_eq!(h.executor.runs_matching("docker node rm alpha-node-1"), 1);
    assert_eq!(h.executor.swarm_status("alpha-node-1").as_deref(), Some("Down"));
    let node = h.controller.get_node("alpha-node-1").await.unwrap();
    assert_eq!(*node.state(), MembershipState::Leaving);
    assert_eq!(h.cloud.call_count("terminate_instances"), 0);
    assert!(h.stack.get_host_by_name("alpha-node-1").await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_join_after_leader_removal_goes_through_live_master() {
    let h = harness(Flavor::Swarm, Complexity::Normal);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    h.controller
        .delete_specific_node("alpha-master-1", &cancel)
        .await
        .unwrap();
    let added = h.controller.add_nodes(1, false, &cancel).await.unwrap();
    let added = added[0].as_str();

    let master_2 = h.stack.get_host_by_name("alpha-master-2").await.unwrap();
    let join = h
        .executor
        .commands_on(added)
        .into_iter()
        .find(|c| c.starts_with("docker swarm join"))
        .expect("new node never joined");
    assert_eq!(
        join,
        format!("docker swarm join --token SWMTKN-worker {}:2377", master_2.private_ip)
    );
    assert!(h
        .executor
        .commands_on("alpha-master-2")
        .iter()
        .any(|c| c == "docker swarm join-token worker -q"));
    assert!(!h
        .executor
        .commands_on("alpha-master-1")
        .iter()
        .any(|c| c.contains("join-token worker")));
    assert_eq!(h.executor.swarm_status(added).as_deref(), Some("Ready"));
}

#[tokio::test(start_paused = true)]
async fn test_master_removal_demotes_first() {
    let h = harness(Flavor::Swarm, Complexity::Normal);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    h.controller
        .delete_specific_node("alpha-master-3", &cancel)
        .await
        .unwrap();

    let on_leader = h.executor.commands_on("alpha-master-1");
    let demote = on_leader
        .iter()
        .position(|c| c == "docker node demote alpha-master-3")
        .expect("master was not demoted");
    let remove = on_leader
        .iter()
        .position(|c| c == "docker node rm alpha-master-3")
        .expect("master was not removed");
    assert!(demote < remove);
    assert_eq!(h.controller.list_master_ids().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_last_master_cannot_be_removed() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    let err = h
        .controller
        .delete_specific_node("alpha-master-1", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisioningError::Precondition(_)));
    assert!(h.controller.get_node("alpha-master-1").await.unwrap().is_member());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_node_is_not_found() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    let err = h
        .controller
        .delete_specific_node("alpha-node-9", &cancel)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

// ============================================================================
// Start / stop / delete
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_then_start() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();
    let ids = h.controller.list_node_ids(false).await;

    h.controller.stop(&cancel).await.unwrap();
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Stopped);
    assert_eq!(h.cloud.call_count("stop_instances"), 3);

    h.controller.start(&cancel).await.unwrap();
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Nominal);
    assert_eq!(h.cloud.call_count("start_instances"), 3);
    assert_eq!(h.controller.list_node_ids(false).await, ids);
}

#[tokio::test(start_paused = true)]
async fn test_stop_requires_created_cluster() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let err = h.controller.stop(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ProvisioningError::Precondition(_)));
}

#[tokio::test(start_paused = true)]
async fn test_delete_releases_everything() {
    let h = harness(Flavor::Swarm, Complexity::Small);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    h.controller.delete(&cancel).await.unwrap();

    assert_eq!(h.cloud.live_resources(), Vec::<String>::new());
    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Removed);
    assert!(h.controller.list_nodes().await.is_empty());
    assert!(h.controller.network().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_degraded_when_a_host_is_stopped_behind_our_back() {
    let h = harness(Flavor::Boh, Complexity::Small);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    let id = h.controller.list_node_ids(false).await.remove(0);
    h.stack.stop_host(&id, &cancel).await.unwrap();

    assert_eq!(h.controller.state().await.unwrap(), ClusterState::Degraded);
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_find_available_master_skips_dead_masters() {
    let h = harness(Flavor::Boh, Complexity::Normal);
    let cancel = CancellationToken::new();
    h.controller.create(&cancel).await.unwrap();

    // the liveness check is `true`; with every master failing it there is no coordinator
    h.executor.fail("true", 1, "");
    let master = h.controller.find_available_master(&cancel).await;
    assert!(master.is_err());
    h.executor.clear_failures();

    let master = h.controller.find_available_master(&cancel).await.unwrap();
    assert_eq!(master.name, "alpha-master-1");
    let node = h.controller.find_available_node(false, &cancel).await.unwrap();
    assert_eq!(node.name, "alpha-node-1");
}
