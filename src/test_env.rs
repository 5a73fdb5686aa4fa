// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    fs, io, net,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    cluster::ClusterManager,
    init::{ClusterInitService, InitSettings, RetryPolicy},
    node::CassandraNode,
    options::DeploymentOptions,
    process::OsProcessControl,
};

/// Given a relative `path` in the test directory, prepend the
/// full path to the test directory.
fn test_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join(path)
}

trait IgnoreEexist {
    fn ignore_eexist(self) -> Self;
}

impl IgnoreEexist for io::Result<()> {
    fn ignore_eexist(self) -> Self {
        match self {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// This struct is used to hold handles to node agent processes so that they can be shut
/// down when the test ends.
pub struct ChildHandle {
    pub handle: std::process::Child,
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        let _ = self.handle.kill();
        let _ = self.handle.wait();
    }
}

/// A TestEnvironment holds all the information needed to access a test's runtime state. This
/// includes a "private" working directory in which the node template, the cluster directory, and
/// the logs of the running test are stored.
///
/// All access to the test's state on the filesystem should be done via methods on TestEnvironment
/// rather than coded in the tests themselves.
pub struct TestEnvironment {
    /// The path to this test's private working directory.
    private_dir: PathBuf,

    /// The node binary path has to be passed in as an argument from the tests because the
    /// CARGO_BIN_EXE_* environment variables aren't defined during non-test compilation.
    node_binary_path: PathBuf,
}

impl TestEnvironment {
    /// Set up an environment for a test named `test_id`.
    ///
    /// Creates a specific unique subdirectory for the test, emptying out anything a previous run
    /// left behind.
    pub fn new(test_id: &str, node_binary_path: &str) -> Self {
        let private_dir = test_path(&format!("test_output/{test_id}"));
        match fs::remove_dir_all(&private_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => panic!("Could not clean up test directory: {e}"),
        };

        fs::create_dir(test_path("test_output"))
            .ignore_eexist()
            .unwrap();
        fs::create_dir(&private_dir).unwrap();

        Self {
            private_dir,
            node_binary_path: PathBuf::from(node_binary_path),
        }
    }

    pub fn private_dir(&self) -> &Path {
        &self.private_dir
    }

    pub fn cluster_dir(&self) -> PathBuf {
        self.private_dir.join("cluster")
    }

    /// Write a node template whose launcher runs the node agent.
    ///
    /// `conf/rhq.node.env` is rendered at deploy time with the node's address, port, and seeds;
    /// `bin/cassandra -p <pidfile>` sources it and execs the agent, which writes the pid file.
    pub fn node_template(&self) -> PathBuf {
        let template = self.private_dir.join("template");
        fs::create_dir_all(template.join("conf")).unwrap();
        fs::create_dir_all(template.join("bin")).unwrap();

        fs::write(
            template.join("conf/rhq.node.env"),
            "CCM_NODE_ADDRESS=${rpc.address}\n\
             CCM_NODE_PORT=${rpc-port}\n\
             CCM_NODE_SEEDS=${seeds}\n",
        )
        .unwrap();
        fs::write(
            template.join("conf/rhq.cassandra.yaml"),
            "cluster_name: ${cluster.name}\n\
             listen_address: ${listen.address}\n\
             initial_token: ${initial.token}\n\
             data_file_directories: ${data.dir}\n",
        )
        .unwrap();
        fs::write(
            template.join("conf/cassandra-jvm.properties"),
            "heap_min=\"-Xms1G\"\nheap_max=\"-Xmx1G\"\n",
        )
        .unwrap();
        fs::write(template.join("bin/cassandra"), self.launcher_script()).unwrap();

        template
    }

    fn launcher_script(&self) -> String {
        format!(
            r#"#!/bin/sh
pidfile=""
while getopts p: opt; do
    case $opt in
        p) pidfile=$OPTARG ;;
    esac
done
dir=$(cd "$(dirname "$0")/.." && pwd)
. "$dir/conf/node.env"
exec "{}" --address "$CCM_NODE_ADDRESS" --port "$CCM_NODE_PORT" --seeds "$CCM_NODE_SEEDS" --pid-file "$pidfile"
"#,
            self.node_binary_path.display()
        )
    }

    /// Write a templating tool for the bootstrap install path. It copies the template, writes
    /// `conf/node.env` from the exported properties, and makes `bin/` executable.
    pub fn templater_script(&self) -> PathBuf {
        let path = self.private_dir.join("render.sh");
        fs::write(
            &path,
            r#"#!/bin/sh
set -e
cp -R "$1"/. "$2"/
printf 'CCM_NODE_ADDRESS=%s\nCCM_NODE_PORT=%s\nCCM_NODE_SEEDS=%s\n' \
    "$CCM_PROP_RPC_ADDRESS" "$CCM_PROP_RPC_PORT" "$CCM_PROP_SEEDS" > "$2/conf/node.env"
rm -f "$2"/conf/rhq.*
chmod +x "$2"/bin/*
"#,
        )
        .unwrap();
        path
    }

    /// Cluster wide options for a local cluster of `num_nodes` whose nodes serve on `port`.
    pub fn options(&self, num_nodes: usize, port: u16) -> DeploymentOptions {
        let mut opts = DeploymentOptions::new();
        opts.set_cluster_dir(self.cluster_dir().to_string_lossy())
            .set_num_nodes(num_nodes)
            .set_rpc_port(port)
            .set_native_transport_port(port + 1)
            .set_jmx_port(port + 100)
            .set_heap_size("256M")
            .set_heap_new_size("64M");
        opts
    }

    /// Poll settings short enough for tests.
    pub fn init_settings() -> InitSettings {
        InitSettings {
            connect_timeout: Duration::from_millis(100),
            poll_delay: Duration::from_millis(50),
            settle_delay: Duration::from_millis(10),
            retries: 100,
            policy: RetryPolicy::Global,
            schema_poll_interval: Duration::from_millis(50),
        }
    }

    pub fn cluster_manager(&self, num_nodes: usize, port: u16) -> ClusterManager {
        ClusterManager::new(
            self.node_template(),
            self.options(num_nodes, port),
            OsProcessControl,
            ClusterInitService::tcp(Self::init_settings()),
        )
    }

    /// Starts a node agent in a new process for each of `nodes`. Node `i` reports schema version
    /// `versions[i]` and uses every other node as a seed.
    ///
    /// Waits until the agents are listening and ready to accept connections before returning, so
    /// that any subsequent code knows the agents are up and ready.
    pub fn start_agents(&self, nodes: &[CassandraNode], versions: &[&str]) -> Vec<ChildHandle> {
        assert_eq!(nodes.len(), versions.len());
        let seeds = nodes
            .iter()
            .map(|n| n.hostname().to_string())
            .collect::<Vec<_>>()
            .join(",");

        let handles = nodes
            .iter()
            .zip(versions)
            .map(|(node, version)| ChildHandle {
                handle: std::process::Command::new(&self.node_binary_path)
                    .args(["--address", node.hostname()])
                    .args(["--port", &node.thrift_port().to_string()])
                    .args(["--schema-version", *version])
                    .args(["--seeds", &seeds])
                    .spawn()
                    .expect("could not launch process"),
            })
            .collect();

        let mut pending: Vec<&CassandraNode> = nodes.iter().collect();
        let mut counter = 40;
        while !pending.is_empty() && counter > 0 {
            // Try to connect to each node; when connecting to one succeeds, remove it from the list
            // but keep trying the others.
            pending.retain(|node| {
                let addr: net::SocketAddr = node.client_address().parse().unwrap();
                match net::TcpStream::connect_timeout(&addr, Duration::from_millis(50)) {
                    Ok(_) => false,
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => true,
                    Err(e) => {
                        panic!("Unexpected error attempting to connect to agent at {addr}: {e}")
                    }
                }
            });

            std::thread::sleep(Duration::from_millis(50));
            counter -= 1;
        }

        handles
    }
}
