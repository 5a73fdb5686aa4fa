// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    deployer::Deployer,
    error::{CcmError, Result},
    init::{ClusterInitService, NodeConnector, TcpConnector},
    node::CassandraNode,
    options::DeploymentOptions,
    process::{self, LaunchCommand, NodeProcess, NodeSignal, OsProcessControl, ProcessControl},
    ring::{self, NodeIdentity},
};

/// Written to the cluster directory once every node has been deployed.
pub const INSTALLED_MARKER: &str = ".installed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    Uninitialized,
    Created,
    Started,
    Shutdown,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ClusterState::Uninitialized => "uninitialized",
                ClusterState::Created => "created",
                ClusterState::Started => "started",
                ClusterState::Shutdown => "shut down",
            }
        )
    }
}

/// The directory of node `ordinal` within `cluster_dir`.
pub fn node_dir(cluster_dir: &Path, ordinal: usize) -> PathBuf {
    cluster_dir.join(format!("node{ordinal}"))
}

/// Deploys, starts and stops a local multi-node cluster.
///
/// The manager owns the cluster directory. Every node is installed from the same template under
/// `<cluster.dir>/node<i>`, and the nodes it knows about are index aligned by ordinal across
/// [`host_names`](Self::host_names), [`jmx_ports`](Self::jmx_ports) and
/// [`cluster_nodes`](Self::cluster_nodes).
pub struct ClusterManager<P = OsProcessControl, C = TcpConnector> {
    /// Cluster wide defaults, layered under each node's own values.
    options: DeploymentOptions,
    template_dir: PathBuf,
    process_control: P,
    init: ClusterInitService<C>,

    addresses: Vec<String>,
    jmx_ports: Vec<u16>,
    client_port: u16,
    native_port: u16,

    /// Handles of the launchers started by this manager, by ordinal.
    processes: BTreeMap<usize, Box<dyn NodeProcess>>,
    state: ClusterState,
}

impl ClusterManager {
    /// A manager that launches real processes and polls nodes over TCP.
    pub fn with_defaults(
        template_dir: impl Into<PathBuf>,
        options: DeploymentOptions,
        init: ClusterInitService,
    ) -> Self {
        ClusterManager::new(template_dir, options, OsProcessControl, init)
    }
}

impl<P: ProcessControl, C: NodeConnector> ClusterManager<P, C> {
    pub fn new(
        template_dir: impl Into<PathBuf>,
        options: DeploymentOptions,
        process_control: P,
        init: ClusterInitService<C>,
    ) -> Self {
        ClusterManager {
            options,
            template_dir: template_dir.into(),
            process_control,
            init,
            addresses: Vec::new(),
            jmx_ports: Vec::new(),
            client_port: 0,
            native_port: 0,
            processes: BTreeMap::new(),
            state: ClusterState::Uninitialized,
        }
    }

    pub fn options(&self) -> &DeploymentOptions {
        &self.options
    }

    pub fn process_control(&self) -> &P {
        &self.process_control
    }

    pub fn init_service(&self) -> &ClusterInitService<C> {
        &self.init
    }

    pub fn state(&self) -> ClusterState {
        self.state
    }

    pub fn cluster_dir(&self) -> Result<PathBuf> {
        self.options
            .cluster_dir()
            .map(PathBuf::from)
            .ok_or_else(|| missing("cluster.dir"))
    }

    pub fn is_cluster_installed(&self) -> bool {
        self.cluster_dir()
            .map(|dir| dir.join(INSTALLED_MARKER).exists())
            .unwrap_or(false)
    }

    /// Install every node of the cluster, or only compute the node descriptors if the cluster
    /// directory already holds a completed install.
    ///
    /// A partial install left by an earlier failure is purged first. The marker is written only
    /// after the last node deployed successfully.
    pub fn create_cluster(&mut self) -> Result<Vec<CassandraNode>> {
        let cluster_dir = self.cluster_dir()?;
        let num_nodes = self.options.num_nodes().ok_or_else(|| missing("num-nodes"))?;
        let jmx_base = self.options.jmx_port().ok_or_else(|| missing("jmx.port"))?;
        self.client_port = self.options.rpc_port().ok_or_else(|| missing("rpc-port"))?;
        self.native_port = self
            .options
            .native_transport_port()
            .ok_or_else(|| missing("native-transport-port"))?;

        let layout = ring::layout(num_nodes, self.options.seeds())?;
        let jmx_ports = layout
            .iter()
            .map(|node| jmx_port(jmx_base, node.ordinal))
            .collect::<Result<Vec<_>>>()?;

        if self.is_cluster_installed() {
            info!(
                "Cluster already installed in '{}', skipping deployment",
                cluster_dir.display()
            );
        } else {
            purge(&cluster_dir)?;
            let addresses: Vec<String> = layout.iter().map(|n| n.address.clone()).collect();

            for (identity, &jmx) in layout.iter().zip(&jmx_ports) {
                let dir = node_dir(&cluster_dir, identity.ordinal);
                info!("Deploying node {} to '{}'", identity.ordinal, dir.display());
                self.deploy_node(identity, jmx, &dir, &addresses)
                    .map_err(|source| CcmError::NodeDeployment {
                        ordinal: identity.ordinal,
                        dir: dir.clone(),
                        source: Box::new(source),
                    })?;
            }

            let marker = cluster_dir.join(INSTALLED_MARKER);
            fs::write(&marker, [0u8]).map_err(|e| CcmError::deployment(&marker, e))?;
        }

        self.addresses = layout.into_iter().map(|n| n.address).collect();
        self.jmx_ports = jmx_ports;
        self.state = ClusterState::Created;
        Ok(self.cluster_nodes())
    }

    fn deploy_node(
        &self,
        identity: &NodeIdentity,
        jmx_port: u16,
        dir: &Path,
        all_addresses: &[String],
    ) -> Result<()> {
        let mut opts = node_options(identity, jmx_port, dir);
        opts.merge(&self.options);

        let deployer = Deployer::new(&self.template_dir, opts);
        deployer.unpack_distro()?;
        deployer.apply_config_changes()?;
        deployer.update_file_perms()?;
        deployer.update_storage_auth_conf(all_addresses)?;
        if all_addresses.len() > 1 {
            deployer.update_remote_jmx(&identity.address)?;
        }
        Ok(())
    }

    pub fn start_cluster(&mut self, wait: bool) -> Result<()> {
        let all: Vec<usize> = (0..self.addresses.len()).collect();
        self.start_nodes(&all, wait)
    }

    /// Launch the given nodes. A node that fails to launch is logged and skipped; with `wait`,
    /// block until every requested node accepts client connections, so a node that did not
    /// launch fails the wait once the retry budget runs out.
    pub fn start_nodes(&mut self, ordinals: &[usize], wait: bool) -> Result<()> {
        if self.state == ClusterState::Uninitialized {
            return Err(CcmError::InvalidState {
                operation: "start",
                state: self.state.to_string(),
            });
        }
        let cluster_dir = self.cluster_dir()?;

        let mut requested = Vec::new();
        for &ordinal in ordinals {
            let Some(node) = self.node(ordinal) else {
                warn!("There is no node {ordinal} in this cluster");
                continue;
            };
            let dir = node_dir(&cluster_dir, ordinal);
            match self.process_control.start(&LaunchCommand::for_node(&dir)) {
                Ok(handle) => {
                    info!("Started node {ordinal} ({node}) with pid {}", handle.id());
                    self.processes.insert(ordinal, handle);
                }
                Err(e) => warn!("Failed to start node {ordinal} in '{}': {e}", dir.display()),
            }
            requested.push(node);
        }
        self.state = ClusterState::Started;

        if wait {
            self.init.wait_for_cluster_to_start(&requested, requested.len())?;
        }
        Ok(())
    }

    pub fn shutdown_cluster(&mut self) -> Result<()> {
        let all: Vec<usize> = (0..self.addresses.len()).collect();
        self.shutdown_nodes(&all)
    }

    /// Send SIGTERM to the pid recorded in each node's pid file. Failures are logged per node and
    /// never stop the remaining nodes from being shut down.
    pub fn shutdown_nodes(&mut self, ordinals: &[usize]) -> Result<()> {
        if self.state == ClusterState::Uninitialized {
            return Err(CcmError::InvalidState {
                operation: "shutdown",
                state: self.state.to_string(),
            });
        }
        let cluster_dir = self.cluster_dir()?;

        for &ordinal in ordinals {
            let dir = node_dir(&cluster_dir, ordinal);
            let pid_file = process::pid_file(&dir);
            match self.process_control.read_pid_file(&pid_file) {
                Ok(pid) => match self.process_control.send_signal(pid, NodeSignal::Terminate) {
                    Ok(()) => info!("Sent {} to node {ordinal} (pid {pid})", NodeSignal::Terminate),
                    Err(e) => warn!("Failed to signal node {ordinal} (pid {pid}): {e}"),
                },
                Err(e) => warn!(
                    "Unable to read pid file '{}' of node {ordinal}: {e}",
                    pid_file.display()
                ),
            }

            if let Some(mut handle) = self.processes.remove(&ordinal) {
                if let Err(e) = handle.destroy() {
                    debug!("could not destroy launcher of node {ordinal}: {e}");
                }
            }
        }
        self.state = ClusterState::Shutdown;
        Ok(())
    }

    pub fn cluster_nodes(&self) -> Vec<CassandraNode> {
        (0..self.addresses.len())
            .filter_map(|ordinal| self.node(ordinal))
            .collect()
    }

    pub fn host_names(&self) -> &[String] {
        &self.addresses
    }

    pub fn jmx_ports(&self) -> &[u16] {
        &self.jmx_ports
    }

    fn node(&self, ordinal: usize) -> Option<CassandraNode> {
        self.addresses
            .get(ordinal)
            .map(|address| CassandraNode::new(address, self.client_port, self.native_port))
    }
}

/// The values that differ from node to node. Cluster wide defaults are merged in after.
pub(crate) fn node_options(
    identity: &NodeIdentity,
    jmx_port: u16,
    dir: &Path,
) -> DeploymentOptions {
    let mut opts = DeploymentOptions::new();
    opts.set_seeds(identity.seeds_option())
        .set_basedir(path_string(dir))
        .set_listen_address(identity.address.as_str())
        .set_rpc_address(identity.address.as_str())
        .set_jmx_port(jmx_port)
        .set_data_dir(path_string(&dir.join("data")))
        .set_commit_log_dir(path_string(&dir.join("commit_log")))
        .set_saved_caches_dir(path_string(&dir.join("saved_caches")))
        .set_log_file(path_string(&dir.join("logs").join("system.log")))
        .set_initial_token(identity.token.to_string());
    opts
}

pub(crate) fn missing(key: &str) -> CcmError {
    CcmError::Configuration(format!("required property '{key}' is not set"))
}

pub(crate) fn jmx_port(base: u16, ordinal: usize) -> Result<u16> {
    u16::try_from(ordinal)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| CcmError::Configuration(format!("no JMX port for node {ordinal}")))
}

pub(crate) fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Remove everything left in `dir` and recreate it empty.
pub(crate) fn purge(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!("purged '{}'", dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(CcmError::deployment(dir, e)),
    }
    fs::create_dir_all(dir).map_err(|e| CcmError::deployment(dir, e))
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashSet, rc::Rc, time::Duration};

    use super::*;
    use crate::{
        deployer::{JVM_PROPERTIES, STORAGE_AUTH_CONF},
        init::{InitSettings, RetryPolicy, SchemaClient},
    };

    #[derive(Default)]
    struct Calls {
        started: Vec<PathBuf>,
        signalled: Vec<(u32, NodeSignal)>,
        destroyed: Vec<u32>,
    }

    /// Hands out pids from 1000 upward and records everything asked of it.
    #[derive(Default)]
    struct FakeProcessControl {
        calls: Rc<RefCell<Calls>>,
        fail_for: Option<PathBuf>,
    }

    struct FakeProcess {
        pid: u32,
        calls: Rc<RefCell<Calls>>,
    }

    impl NodeProcess for FakeProcess {
        fn id(&self) -> u32 {
            self.pid
        }

        fn destroy(&mut self) -> io::Result<()> {
            self.calls.borrow_mut().destroyed.push(self.pid);
            Ok(())
        }
    }

    impl ProcessControl for FakeProcessControl {
        fn start(&self, command: &LaunchCommand) -> io::Result<Box<dyn NodeProcess>> {
            if self.fail_for.as_deref() == Some(command.working_dir.as_path()) {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            let mut calls = self.calls.borrow_mut();
            calls.started.push(command.working_dir.clone());
            Ok(Box::new(FakeProcess {
                pid: 1000 + calls.started.len() as u32,
                calls: Rc::clone(&self.calls),
            }))
        }

        fn send_signal(&self, pid: u32, signal: NodeSignal) -> io::Result<()> {
            self.calls.borrow_mut().signalled.push((pid, signal));
            Ok(())
        }
    }

    struct AllUp;

    impl NodeConnector for AllUp {
        fn is_reachable(&self, _node: &CassandraNode, _timeout: Duration) -> bool {
            true
        }

        fn connect(
            &self,
            node: &CassandraNode,
            _timeout: Duration,
        ) -> Result<Box<dyn SchemaClient>> {
            Err(CcmError::Protocol(format!("no schema client for {node}")))
        }
    }

    /// Only the listed hosts accept connections.
    struct UpOnly(HashSet<&'static str>);

    impl NodeConnector for UpOnly {
        fn is_reachable(&self, node: &CassandraNode, _timeout: Duration) -> bool {
            self.0.contains(node.hostname())
        }

        fn connect(
            &self,
            node: &CassandraNode,
            _timeout: Duration,
        ) -> Result<Box<dyn SchemaClient>> {
            Err(CcmError::Protocol(format!("no schema client for {node}")))
        }
    }

    fn template(root: &Path) -> PathBuf {
        let template = root.join("template");
        fs::create_dir_all(template.join("conf")).unwrap();
        fs::create_dir_all(template.join("bin")).unwrap();
        fs::write(
            template.join("conf/rhq.cassandra.yaml"),
            "listen_address: ${listen.address}\nseeds: ${seeds}\ninitial_token: ${initial.token}\n",
        )
        .unwrap();
        fs::write(template.join("conf").join(JVM_PROPERTIES), "heap_min=\"-Xms1G\"\n").unwrap();
        fs::write(template.join("bin/cassandra"), "#!/bin/sh\n").unwrap();
        template
    }

    fn options(cluster_dir: &Path, num_nodes: usize) -> DeploymentOptions {
        let mut opts = DeploymentOptions::new();
        opts.set_cluster_dir(cluster_dir.to_string_lossy())
            .set_num_nodes(num_nodes)
            .set_jmx_port(7200)
            .set_rpc_port(9160)
            .set_native_transport_port(9142)
            .set_heap_size("256M");
        opts
    }

    fn settings(retries: u32) -> InitSettings {
        InitSettings {
            connect_timeout: Duration::ZERO,
            poll_delay: Duration::ZERO,
            settle_delay: Duration::ZERO,
            retries,
            policy: RetryPolicy::Global,
            schema_poll_interval: Duration::ZERO,
        }
    }

    fn manager(root: &Path, num_nodes: usize) -> ClusterManager<FakeProcessControl, AllUp> {
        ClusterManager::new(
            template(root),
            options(&root.join("cluster"), num_nodes),
            FakeProcessControl::default(),
            ClusterInitService::new(AllUp, settings(0)),
        )
    }

    #[test]
    fn creates_a_three_node_cluster() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 3);
        let cluster_dir = root.path().join("cluster");

        let nodes = manager.create_cluster().unwrap();
        assert_eq!(manager.state(), ClusterState::Created);
        assert!(manager.is_cluster_installed());
        assert_eq!(fs::read(cluster_dir.join(INSTALLED_MARKER)).unwrap(), vec![0u8]);

        assert_eq!(
            nodes.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
            vec![
                "127.0.0.1|9160|9142",
                "127.0.0.2|9160|9142",
                "127.0.0.3|9160|9142"
            ]
        );
        assert_eq!(manager.jmx_ports(), &[7200, 7201, 7202]);

        let yaml = fs::read_to_string(cluster_dir.join("node1/conf/cassandra.yaml")).unwrap();
        assert_eq!(
            yaml,
            format!(
                "listen_address: 127.0.0.2\nseeds: 127.0.0.1,127.0.0.3\ninitial_token: {}\n",
                ring::initial_token(1, 3)
            )
        );
        for i in 0..3 {
            let node = cluster_dir.join(format!("node{i}"));
            assert!(node.join("data").is_dir());
            assert!(node.join("commit_log").is_dir());
            assert!(node.join("saved_caches").is_dir());
            assert_eq!(
                fs::read_to_string(node.join("conf").join(STORAGE_AUTH_CONF)).unwrap(),
                "127.0.0.1\n127.0.0.2\n127.0.0.3\n"
            );
        }
        let jvm = fs::read_to_string(cluster_dir.join("node2/conf").join(JVM_PROPERTIES)).unwrap();
        assert!(jvm.contains("heap_min=\"-Xms256M\""));
        assert!(jvm.contains("jmx_port=\"7202\""));
        assert!(jvm.contains("-Djava.rmi.server.hostname=127.0.0.3"));
    }

    #[test]
    fn recreate_keeps_an_installed_cluster() {
        let root = tempfile::tempdir().unwrap();
        let mut first = manager(root.path(), 2);
        let nodes = first.create_cluster().unwrap();

        let yaml = root.path().join("cluster/node0/conf/cassandra.yaml");
        fs::write(&yaml, "edited\n").unwrap();

        let mut second = manager(root.path(), 2);
        assert_eq!(second.create_cluster().unwrap(), nodes);
        assert_eq!(fs::read_to_string(&yaml).unwrap(), "edited\n");
        assert_eq!(second.jmx_ports(), first.jmx_ports());
    }

    #[test]
    fn partial_install_is_purged() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join("cluster/node5");
        fs::create_dir_all(&stale).unwrap();

        manager(root.path(), 2).create_cluster().unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn failed_deploy_names_the_node_and_skips_the_marker() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = ClusterManager::new(
            root.path().join("no-template"),
            options(&root.path().join("cluster"), 2),
            FakeProcessControl::default(),
            ClusterInitService::new(AllUp, InitSettings::default()),
        );

        match manager.create_cluster().unwrap_err() {
            CcmError::NodeDeployment { ordinal, dir, .. } => {
                assert_eq!(ordinal, 0);
                assert_eq!(dir, root.path().join("cluster/node0"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!manager.is_cluster_installed());
        assert_eq!(manager.state(), ClusterState::Uninitialized);
    }

    #[test]
    fn single_node_skips_remote_jmx() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 1);
        manager.create_cluster().unwrap();

        let conf = root.path().join("cluster/node0/conf");
        let yaml = fs::read_to_string(conf.join("cassandra.yaml")).unwrap();
        assert!(yaml.contains("seeds: 127.0.0.1\n"));
        let jvm = fs::read_to_string(conf.join(JVM_PROPERTIES)).unwrap();
        assert!(!jvm.contains("java_rmi_server_hostname"));
    }

    #[test]
    fn start_requires_create() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 2);
        assert!(matches!(
            manager.start_cluster(false),
            Err(CcmError::InvalidState { .. })
        ));
    }

    #[test]
    fn start_skips_nodes_that_fail_to_launch() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 3);
        manager.process_control.fail_for = Some(root.path().join("cluster/node1"));
        manager.create_cluster().unwrap();

        manager.start_cluster(true).unwrap();
        assert_eq!(manager.state(), ClusterState::Started);
        let calls = manager.process_control().calls.borrow();
        assert_eq!(
            calls.started,
            vec![
                root.path().join("cluster/node0"),
                root.path().join("cluster/node2")
            ]
        );
    }

    #[test]
    fn waiting_start_fails_when_a_node_did_not_launch() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = ClusterManager::new(
            template(root.path()),
            options(&root.path().join("cluster"), 3),
            FakeProcessControl {
                fail_for: Some(root.path().join("cluster/node1")),
                ..Default::default()
            },
            ClusterInitService::new(UpOnly(HashSet::from(["127.0.0.1", "127.0.0.3"])), settings(3)),
        );
        manager.create_cluster().unwrap();

        assert!(matches!(
            manager.start_cluster(true),
            Err(CcmError::RetriesExceeded {
                confirmed: 2,
                required: 3,
                ..
            })
        ));
        assert_eq!(manager.process_control().calls.borrow().started.len(), 2);

        // Waiting on a subset only covers the requested nodes.
        manager.start_nodes(&[0, 2], true).unwrap();
        assert!(manager.start_nodes(&[1], true).is_err());
    }

    #[test]
    fn shutdown_continues_past_a_missing_pid_file() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 3);
        manager.create_cluster().unwrap();
        manager.start_nodes(&[0, 1, 2], false).unwrap();

        let cluster_dir = root.path().join("cluster");
        fs::write(process::pid_file(&node_dir(&cluster_dir, 1)), "4001\n").unwrap();
        fs::write(process::pid_file(&node_dir(&cluster_dir, 2)), "4002").unwrap();

        manager.shutdown_cluster().unwrap();
        assert_eq!(manager.state(), ClusterState::Shutdown);

        let calls = manager.process_control().calls.borrow();
        assert_eq!(
            calls.signalled,
            vec![(4001, NodeSignal::Terminate), (4002, NodeSignal::Terminate)]
        );
        assert_eq!(calls.destroyed, vec![1001, 1002, 1003]);
    }

    #[test]
    fn shutdown_then_start_again() {
        let root = tempfile::tempdir().unwrap();
        let mut manager = manager(root.path(), 2);
        manager.create_cluster().unwrap();
        manager.start_cluster(false).unwrap();
        manager.shutdown_nodes(&[1]).unwrap();
        manager.start_nodes(&[1], false).unwrap();
        assert_eq!(manager.state(), ClusterState::Started);
        assert_eq!(manager.process_control().calls.borrow().started.len(), 3);
    }
}
