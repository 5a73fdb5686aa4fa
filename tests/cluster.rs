// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

// These tests bind several 127.0.0.x addresses, which only Linux routes to the loopback
// interface without extra configuration.
#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use std::{fs, thread, time::Duration};

    use ccm_lib::{
        cluster::{node_dir, ClusterState},
        error::CcmError,
        init::{ClusterInitService, InitSettings, RetryPolicy},
        node::CassandraNode,
        process,
        protocol::{NodeClient, UNREACHABLE},
        test_env::*,
    };

    /// Create a TestEnvironment for a test.
    ///
    /// The path to the node binary needs to be determined here and passed into the
    /// TestEnvironment constructor because the environment variable is only defined when compiling
    /// tests.
    fn test_env_helper(test_id: &str) -> TestEnvironment {
        TestEnvironment::new(test_id, env!("CARGO_BIN_EXE_ccm_node"))
    }

    fn wait_until_down(init: &ClusterInitService, nodes: &[CassandraNode]) -> bool {
        for _ in 0..40 {
            if !init.ping(nodes, 1) {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    #[test]
    fn three_node_lifecycle() {
        let env = test_env_helper("three_node_lifecycle");
        let mut manager = env.cluster_manager(3, 19160);

        let nodes = manager.create_cluster().unwrap();
        assert_eq!(
            manager.host_names(),
            &["127.0.0.1", "127.0.0.2", "127.0.0.3"]
        );
        assert_eq!(manager.jmx_ports(), &[19260, 19261, 19262]);

        manager.start_cluster(true).unwrap();
        assert_eq!(manager.state(), ClusterState::Started);

        for i in 0..3 {
            let pid_file = process::pid_file(&node_dir(&env.cluster_dir(), i));
            assert!(pid_file.exists(), "missing {}", pid_file.display());
        }

        let init = manager.init_service();
        assert!(init.ping(&nodes, 3));
        init.wait_for_schema_agreement(&nodes).unwrap();

        let mut client = NodeClient::connect(&nodes[1], Duration::from_secs(1)).unwrap();
        let versions = client.describe_schema_versions().unwrap();
        assert_eq!(versions.len(), 1);
        assert!(!versions.contains_key(UNREACHABLE));
        drop(client);

        manager.shutdown_cluster().unwrap();
        assert_eq!(manager.state(), ClusterState::Shutdown);
        assert!(wait_until_down(manager.init_service(), &nodes));
    }

    #[test]
    fn restart_a_single_node() {
        let env = test_env_helper("restart_a_single_node");
        let mut manager = env.cluster_manager(2, 19170);
        let nodes = manager.create_cluster().unwrap();
        assert_eq!(nodes[1].to_string(), "127.0.0.2|19170|19171");

        manager.start_cluster(true).unwrap();
        manager.shutdown_nodes(&[1]).unwrap();
        assert!(wait_until_down(manager.init_service(), &nodes[1..]));
        assert!(manager.init_service().ping(&nodes[..1], 1));

        manager.start_nodes(&[1], true).unwrap();
        assert!(manager.init_service().ping(&nodes, 2));

        manager.shutdown_cluster().unwrap();
        assert!(wait_until_down(manager.init_service(), &nodes));
    }

    #[test]
    fn agents_report_disagreement_and_unreachable_seeds() {
        let env = test_env_helper("schema_disagreement");
        let nodes: Vec<CassandraNode> = (1..=3)
            .map(|i| CassandraNode::new(&format!("127.0.1.{i}"), 19180, 19181))
            .collect();

        let _agents = env.start_agents(&nodes[..2], &["v1", "v2"]);

        let mut client = NodeClient::connect(&nodes[0], Duration::from_secs(1)).unwrap();
        assert_eq!(client.local_schema_version().unwrap(), "v1");

        // The third node was never started, but the first two only know each other.
        let versions = client.describe_schema_versions().unwrap();
        assert_eq!(versions["v1"], vec!["127.0.1.1".to_string()]);
        assert_eq!(versions["v2"], vec!["127.0.1.2".to_string()]);
        assert!(!ccm_lib::init::schema_agreement(&versions, &nodes[..2]));
    }

    #[test]
    fn waiting_for_more_nodes_than_are_up_fails() {
        let env = test_env_helper("too_few_nodes");
        let nodes: Vec<CassandraNode> = (1..=3)
            .map(|i| CassandraNode::new(&format!("127.0.2.{i}"), 19190, 19191))
            .collect();
        let _agents = env.start_agents(&nodes[..2], &["v1", "v1"]);

        let settings = InitSettings {
            retries: 5,
            policy: RetryPolicy::Global,
            ..TestEnvironment::init_settings()
        };
        let init = ClusterInitService::tcp(settings);

        init.wait_for_cluster_to_start(&nodes, 2).unwrap();
        assert!(matches!(
            init.wait_for_cluster_to_start(&nodes, 3),
            Err(CcmError::RetriesExceeded { required: 3, .. })
        ));
        assert!(init.ping(&nodes, 2));
        assert!(!init.ping(&nodes, 3));
    }

    #[test]
    fn launcher_output_is_logged() {
        let env = test_env_helper("launcher_log");
        let mut manager = env.cluster_manager(1, 19200);
        manager.create_cluster().unwrap();

        // Break the launcher so it exits with an error message.
        let launcher = node_dir(&env.cluster_dir(), 0).join("bin/cassandra");
        fs::write(&launcher, "#!/bin/sh\necho launcher failed >&2\nexit 1\n").unwrap();

        manager.start_cluster(false).unwrap();
        let log = node_dir(&env.cluster_dir(), 0).join(process::LAUNCHER_LOG);
        let mut logged = false;
        for _ in 0..40 {
            if fs::read_to_string(&log).unwrap_or_default().contains("launcher failed") {
                logged = true;
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(logged);

        // No pid file was ever written; shutdown still succeeds.
        manager.shutdown_cluster().unwrap();
    }
}
