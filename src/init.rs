// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Readiness polling for a freshly started cluster.
//!
//! Both waits block the calling thread and sleep a fixed interval between attempts. Only the
//! reachability wait has a retry ceiling; the schema agreement wait runs until the cluster
//! agrees or the query itself fails.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    net::TcpStream,
    thread,
    time::Duration,
};

use tracing::{debug, info, warn};

use crate::{
    error::{CcmError, Result},
    node::CassandraNode,
    protocol::{self, NodeClient, UNREACHABLE},
};

/// A connection that can report the schema versions in use across the cluster.
pub trait SchemaClient {
    fn describe_schema_versions(&mut self) -> Result<BTreeMap<String, Vec<String>>>;
}

impl SchemaClient for NodeClient {
    fn describe_schema_versions(&mut self) -> Result<BTreeMap<String, Vec<String>>> {
        NodeClient::describe_schema_versions(self)
    }
}

/// Network access used by [`ClusterInitService`].
pub trait NodeConnector {
    /// Whether `node` accepts a connection on its client port within `timeout`.
    fn is_reachable(&self, node: &CassandraNode, timeout: Duration) -> bool;

    /// Open a persistent client connection to `node`.
    fn connect(&self, node: &CassandraNode, timeout: Duration) -> Result<Box<dyn SchemaClient>>;
}

/// Checks reachability and connects over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl NodeConnector for TcpConnector {
    fn is_reachable(&self, node: &CassandraNode, timeout: Duration) -> bool {
        let addr = match protocol::socket_addr(node.hostname(), node.thrift_port()) {
            Ok(addr) => addr,
            Err(e) => {
                warn!("could not resolve {}: {e}", node.client_address());
                return false;
            }
        };
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_) => true,
            Err(e) => {
                debug!("unable to open connection to {addr}: {e}");
                false
            }
        }
    }

    fn connect(&self, node: &CassandraNode, timeout: Duration) -> Result<Box<dyn SchemaClient>> {
        Ok(Box::new(NodeClient::connect(node, timeout)?))
    }
}

/// How failed reachability checks are counted against the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// One counter shared by every node. A single node that never comes up can use the whole
    /// budget and abort the wait even while other nodes are still starting.
    #[default]
    Global,
    /// A counter per node; the wait aborts once any one node exceeds the budget.
    PerNode,
}

#[derive(Debug, Clone)]
pub struct InitSettings {
    /// Timeout of a single connection attempt.
    pub connect_timeout: Duration,
    /// Sleep after each failed reachability check.
    pub poll_delay: Duration,
    /// Sleep after enough nodes were confirmed, letting bootstrap side effects finish.
    pub settle_delay: Duration,
    pub retries: u32,
    pub policy: RetryPolicy,
    /// Sleep between schema version queries.
    pub schema_poll_interval: Duration,
}

impl Default for InitSettings {
    fn default() -> Self {
        InitSettings {
            connect_timeout: Duration::from_millis(100),
            poll_delay: Duration::from_millis(250),
            settle_delay: Duration::from_secs(10),
            retries: 25,
            policy: RetryPolicy::Global,
            schema_poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterInitService<C = TcpConnector> {
    connector: C,
    settings: InitSettings,
}

impl ClusterInitService<TcpConnector> {
    pub fn tcp(settings: InitSettings) -> Self {
        Self::new(TcpConnector, settings)
    }
}

impl<C: NodeConnector> ClusterInitService<C> {
    pub fn new(connector: C, settings: InitSettings) -> Self {
        ClusterInitService {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &InitSettings {
        &self.settings
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Try every node once, without retrying. Returns true if at least `num_hosts` accepted a
    /// connection.
    pub fn ping(&self, nodes: &[CassandraNode], num_hosts: usize) -> bool {
        let connected = nodes
            .iter()
            .filter(|node| self.connector.is_reachable(node, self.settings.connect_timeout))
            .count();
        debug!("ping: {connected} of {} nodes accepted a connection", nodes.len());
        connected >= num_hosts
    }

    /// Block until `num_hosts` of `nodes` accept connections.
    ///
    /// Nodes are checked in FIFO order. A node that accepts a connection is done; one that
    /// refuses goes to the back of the queue. Fails once the failure count exceeds the retry
    /// budget. Asking for more hosts than `nodes` holds is a configuration error.
    pub fn wait_for_cluster_to_start(
        &self,
        nodes: &[CassandraNode],
        num_hosts: usize,
    ) -> Result<()> {
        if num_hosts > nodes.len() {
            return Err(CcmError::Configuration(format!(
                "cannot wait for {num_hosts} nodes to start when the cluster has {}",
                nodes.len()
            )));
        }

        let mut queue: VecDeque<usize> = (0..nodes.len()).collect();
        let mut per_node_failures: HashMap<usize, u32> = HashMap::new();
        let mut failures: u32 = 0;
        let mut confirmed: usize = 0;

        while confirmed < num_hosts {
            let Some(index) = queue.pop_front() else {
                return Err(CcmError::RetriesExceeded {
                    attempts: failures,
                    confirmed,
                    required: num_hosts,
                });
            };
            let node = &nodes[index];

            if self.connector.is_reachable(node, self.settings.connect_timeout) {
                confirmed += 1;
                info!("Successfully connected to {node} ({confirmed}/{num_hosts})");
                continue;
            }

            failures += 1;
            let node_failures = per_node_failures.entry(index).or_insert(0);
            *node_failures += 1;

            let exhausted = match self.settings.policy {
                RetryPolicy::Global => failures > self.settings.retries,
                RetryPolicy::PerNode => *node_failures > self.settings.retries,
            };
            if exhausted {
                return Err(CcmError::RetriesExceeded {
                    attempts: failures,
                    confirmed,
                    required: num_hosts,
                });
            }

            debug!("{node} is not up yet, failed attempts: {failures}");
            queue.push_back(index);
            thread::sleep(self.settings.poll_delay);
        }

        thread::sleep(self.settings.settle_delay);
        Ok(())
    }

    /// Block until every node reports the same schema version, as seen through a connection to
    /// the first node. Returns at once when `nodes` is empty.
    pub fn wait_for_schema_agreement(&self, nodes: &[CassandraNode]) -> Result<()> {
        let Some(first) = nodes.first() else {
            return Ok(());
        };
        let mut client = self.connector.connect(first, self.settings.connect_timeout)?;

        loop {
            let versions = client.describe_schema_versions()?;
            if schema_agreement(&versions, nodes) {
                info!("Schema agreement reached across {} nodes", nodes.len());
                return Ok(());
            }
            debug!("waiting for schema agreement, versions: {versions:?}");
            thread::sleep(self.settings.schema_poll_interval);
        }
    }
}

/// True when exactly one schema version is in use and every node reports it.
pub fn schema_agreement(versions: &BTreeMap<String, Vec<String>>, nodes: &[CassandraNode]) -> bool {
    if versions.len() != 1 {
        return false;
    }
    let Some((version, hosts)) = versions.iter().next() else {
        return false;
    };
    version != UNREACHABLE
        && nodes
            .iter()
            .all(|node| hosts.iter().any(|h| h == node.hostname()))
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::HashSet,
        rc::Rc,
    };

    use super::*;

    /// Nodes listed in `up` accept connections; every check is counted.
    struct FakeConnector {
        up: HashSet<String>,
        checks: Cell<u32>,
        /// Replies handed out by the schema client, in order.
        replies: Rc<RefCell<VecDeque<Result<BTreeMap<String, Vec<String>>>>>>,
    }

    impl FakeConnector {
        fn new(up: &[&str]) -> Self {
            FakeConnector {
                up: up.iter().map(|s| s.to_string()).collect(),
                checks: Cell::new(0),
                replies: Rc::new(RefCell::new(VecDeque::new())),
            }
        }
    }

    struct FakeClient {
        replies: Rc<RefCell<VecDeque<Result<BTreeMap<String, Vec<String>>>>>>,
    }

    impl SchemaClient for FakeClient {
        fn describe_schema_versions(&mut self) -> Result<BTreeMap<String, Vec<String>>> {
            self.replies
                .borrow_mut()
                .pop_front()
                .expect("test ran out of schema replies")
        }
    }

    impl NodeConnector for FakeConnector {
        fn is_reachable(&self, node: &CassandraNode, _timeout: Duration) -> bool {
            self.checks.set(self.checks.get() + 1);
            self.up.contains(node.hostname())
        }

        fn connect(
            &self,
            node: &CassandraNode,
            _timeout: Duration,
        ) -> Result<Box<dyn SchemaClient>> {
            if !self.up.contains(node.hostname()) {
                return Err(CcmError::Connectivity {
                    node: node.client_address(),
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                });
            }
            Ok(Box::new(FakeClient {
                replies: Rc::clone(&self.replies),
            }))
        }
    }

    fn settings(retries: u32, policy: RetryPolicy) -> InitSettings {
        InitSettings {
            connect_timeout: Duration::ZERO,
            poll_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            retries,
            policy,
            schema_poll_interval: Duration::ZERO,
        }
    }

    fn nodes(n: usize) -> Vec<CassandraNode> {
        (1..=n)
            .map(|i| CassandraNode::new(&format!("127.0.0.{i}"), 9160, 9142))
            .collect()
    }

    #[test]
    fn waits_for_the_nodes_that_are_up() {
        let nodes = nodes(5);
        let retries = 4;
        let service = ClusterInitService::new(
            FakeConnector::new(&["127.0.0.2", "127.0.0.4", "127.0.0.5"]),
            settings(retries, RetryPolicy::Global),
        );

        service.wait_for_cluster_to_start(&nodes, 3).unwrap();
        assert!(service.connector().checks.get() <= nodes.len() as u32 + retries);
    }

    #[test]
    fn one_more_than_is_up_exceeds_retries() {
        let nodes = nodes(4);
        let service = ClusterInitService::new(
            FakeConnector::new(&["127.0.0.1", "127.0.0.3"]),
            settings(6, RetryPolicy::Global),
        );

        let err = service.wait_for_cluster_to_start(&nodes, 3).unwrap_err();
        match err {
            CcmError::RetriesExceeded {
                attempts,
                confirmed,
                required,
            } => {
                assert_eq!(attempts, 7);
                assert_eq!(confirmed, 2);
                assert_eq!(required, 3);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn asking_for_more_nodes_than_exist_fails() {
        let nodes = nodes(2);
        let service = ClusterInitService::new(
            FakeConnector::new(&["127.0.0.1", "127.0.0.2"]),
            settings(10, RetryPolicy::Global),
        );
        let err = service.wait_for_cluster_to_start(&nodes, 3).unwrap_err();
        assert!(matches!(err, CcmError::Configuration(_)));
        assert!(err.to_string().contains("cannot wait for 3 nodes"));
        assert_eq!(service.connector().checks.get(), 0);
    }

    #[test]
    fn global_budget_is_shared_but_per_node_is_not() {
        // Two nodes down while the one we need sits at the back of the queue: the down nodes use
        // two failures before it is checked.
        let nodes = nodes(3);
        let up = ["127.0.0.3"];

        let global =
            ClusterInitService::new(FakeConnector::new(&up), settings(1, RetryPolicy::Global));
        assert!(global.wait_for_cluster_to_start(&nodes, 1).is_err());

        let per_node =
            ClusterInitService::new(FakeConnector::new(&up), settings(1, RetryPolicy::PerNode));
        per_node.wait_for_cluster_to_start(&nodes, 1).unwrap();
    }

    #[test]
    fn ping_makes_one_pass() {
        let nodes = nodes(3);
        let service = ClusterInitService::new(
            FakeConnector::new(&["127.0.0.1", "127.0.0.2"]),
            settings(0, RetryPolicy::Global),
        );
        assert!(service.ping(&nodes, 2));
        assert!(!service.ping(&nodes, 3));
        assert_eq!(service.connector().checks.get(), 6);
    }

    #[test]
    fn schema_agreement_requires_one_version_on_every_node() {
        let nodes = nodes(2);
        let hosts = |h: &[&str]| h.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let agreed = BTreeMap::from([("v1".to_string(), hosts(&["127.0.0.1", "127.0.0.2"]))]);
        assert!(schema_agreement(&agreed, &nodes));

        let split = BTreeMap::from([
            ("v1".to_string(), hosts(&["127.0.0.1"])),
            ("v2".to_string(), hosts(&["127.0.0.2"])),
        ]);
        assert!(!schema_agreement(&split, &nodes));

        let partial = BTreeMap::from([("v1".to_string(), hosts(&["127.0.0.1"]))]);
        assert!(!schema_agreement(&partial, &nodes));

        let unreachable = BTreeMap::from([(
            UNREACHABLE.to_string(),
            hosts(&["127.0.0.1", "127.0.0.2"]),
        )]);
        assert!(!schema_agreement(&unreachable, &nodes));
    }

    #[test]
    fn schema_wait_polls_until_agreement() {
        let nodes = nodes(2);
        let connector = FakeConnector::new(&["127.0.0.1", "127.0.0.2"]);
        {
            let mut replies = connector.replies.borrow_mut();
            replies.push_back(Ok(BTreeMap::from([
                ("v1".to_string(), vec!["127.0.0.1".to_string()]),
                ("v2".to_string(), vec!["127.0.0.2".to_string()]),
            ])));
            replies.push_back(Ok(BTreeMap::from([(
                "v2".to_string(),
                vec!["127.0.0.1".to_string(), "127.0.0.2".to_string()],
            )])));
        }
        let service = ClusterInitService::new(connector, settings(0, RetryPolicy::Global));
        service.wait_for_schema_agreement(&nodes).unwrap();
        assert!(service.connector().replies.borrow().is_empty());
    }

    #[test]
    fn schema_query_errors_abort() {
        let nodes = nodes(2);
        let connector = FakeConnector::new(&["127.0.0.1"]);
        connector
            .replies
            .borrow_mut()
            .push_back(Err(CcmError::Protocol("boom".to_string())));
        let service = ClusterInitService::new(connector, settings(0, RetryPolicy::Global));
        assert!(matches!(
            service.wait_for_schema_agreement(&nodes),
            Err(CcmError::Protocol(_))
        ));

        let down =
            ClusterInitService::new(FakeConnector::new(&[]), settings(0, RetryPolicy::Global));
        assert!(matches!(
            down.wait_for_schema_agreement(&nodes),
            Err(CcmError::Connectivity { .. })
        ));
    }
}
