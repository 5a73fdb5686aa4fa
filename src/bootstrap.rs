// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Install paths that hand templating to an external tool.
//!
//! [`BootstrapDeployer`] lays out a whole ring like the cluster manager does, then gives each
//! node's property bag to an [`ExternalTemplater`] instead of rendering templates in process.
//! [`UnmanagedDeployer`] installs one standalone node with no ring computation, and
//! [`start_standalone`] launches it once installed.

use std::{
    collections::BTreeMap,
    fs, io,
    net::TcpListener,
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{debug, info, warn};

use crate::{
    cluster::{self, INSTALLED_MARKER},
    config::override_name,
    deployer::{Deployer, CLUSTER_NAME},
    error::{CcmError, Result},
    init::{ClusterInitService, NodeConnector},
    node::CassandraNode,
    options::DeploymentOptions,
    process::{LaunchCommand, NodeProcess, ProcessControl},
    ring::{self, NodeIdentity},
};

/// Renders one node install from a template.
pub trait ExternalTemplater {
    fn render(
        &self,
        template_dir: &Path,
        install_dir: &Path,
        properties: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Runs `program [args...] <template dir> <install dir>` with every property exported as
/// `CCM_PROP_<KEY>`.
#[derive(Debug, Clone)]
pub struct CommandTemplater {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandTemplater {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        CommandTemplater {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// The environment variable a property is exported as, e.g. `CCM_PROP_LISTEN_ADDRESS`.
pub fn property_env_name(key: &str) -> String {
    override_name(key).replacen("CCM_", "CCM_PROP_", 1)
}

impl ExternalTemplater for CommandTemplater {
    fn render(
        &self,
        template_dir: &Path,
        install_dir: &Path,
        properties: &BTreeMap<String, String>,
    ) -> Result<()> {
        let failed = |message: String| CcmError::Templating {
            program: self.program.display().to_string(),
            dir: install_dir.to_path_buf(),
            message,
        };

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(template_dir)
            .arg(install_dir)
            .envs(properties.iter().map(|(k, v)| (property_env_name(k), v)))
            .output()
            .map_err(|e| failed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = match stderr.trim() {
                "" => format!("exited with {}", output.status),
                stderr => format!("exited with {}: {stderr}", output.status),
            };
            return Err(failed(message));
        }
        debug!(
            "'{}' rendered '{}'",
            self.program.display(),
            install_dir.display()
        );
        Ok(())
    }
}

/// The bag handed to the templater: every option plus the node's place in the install.
fn property_bag(
    options: &DeploymentOptions,
    ordinal: usize,
    template_dir: &Path,
    install_dir: &Path,
) -> BTreeMap<String, String> {
    let mut bag = options.to_map();
    bag.insert("cluster.name".to_string(), CLUSTER_NAME.to_string());
    bag.insert("node.ordinal".to_string(), ordinal.to_string());
    bag.insert("template.dir".to_string(), cluster::path_string(template_dir));
    bag.insert("install.dir".to_string(), cluster::path_string(install_dir));
    bag
}

/// Installs a ring of nodes through an [`ExternalTemplater`].
pub struct BootstrapDeployer<T> {
    template_dir: PathBuf,
    options: DeploymentOptions,
    templater: T,
}

impl<T: ExternalTemplater> BootstrapDeployer<T> {
    pub fn new(template_dir: impl Into<PathBuf>, options: DeploymentOptions, templater: T) -> Self {
        BootstrapDeployer {
            template_dir: template_dir.into(),
            options,
            templater,
        }
    }

    pub fn templater(&self) -> &T {
        &self.templater
    }

    /// Install every node unless the cluster directory holds a completed install. Returns the
    /// ring layout either way.
    pub fn deploy(&self) -> Result<Vec<NodeIdentity>> {
        let cluster_dir = self
            .options
            .cluster_dir()
            .map(PathBuf::from)
            .ok_or_else(|| cluster::missing("cluster.dir"))?;
        let num_nodes = self
            .options
            .num_nodes()
            .ok_or_else(|| cluster::missing("num-nodes"))?;
        let jmx_base = self
            .options
            .jmx_port()
            .ok_or_else(|| cluster::missing("jmx.port"))?;

        let layout = ring::layout(num_nodes, self.options.seeds())?;
        if cluster_dir.join(INSTALLED_MARKER).exists() {
            info!(
                "Cluster already installed in '{}', skipping deployment",
                cluster_dir.display()
            );
            return Ok(layout);
        }

        cluster::purge(&cluster_dir)?;
        let addresses: Vec<String> = layout.iter().map(|n| n.address.clone()).collect();
        for identity in &layout {
            let dir = cluster::node_dir(&cluster_dir, identity.ordinal);
            self.deploy_node(identity, jmx_base, &dir, &addresses)
                .map_err(|source| CcmError::NodeDeployment {
                    ordinal: identity.ordinal,
                    dir: dir.clone(),
                    source: Box::new(source),
                })?;
        }

        let marker = cluster_dir.join(INSTALLED_MARKER);
        fs::write(&marker, [0u8]).map_err(|e| CcmError::deployment(&marker, e))?;
        Ok(layout)
    }

    fn deploy_node(
        &self,
        identity: &NodeIdentity,
        jmx_base: u16,
        dir: &Path,
        addresses: &[String],
    ) -> Result<()> {
        let jmx_port = cluster::jmx_port(jmx_base, identity.ordinal)?;
        let mut opts = cluster::node_options(identity, jmx_port, dir);
        opts.merge(&self.options);

        info!("Templating node {} into '{}'", identity.ordinal, dir.display());
        fs::create_dir_all(dir).map_err(|e| CcmError::deployment(dir, e))?;
        let bag = property_bag(&opts, identity.ordinal, &self.template_dir, dir);
        self.templater.render(&self.template_dir, dir, &bag)?;

        Deployer::new(&self.template_dir, opts).update_storage_auth_conf(addresses)
    }
}

/// Installs a single node that no cluster manager will start or stop.
pub struct UnmanagedDeployer<T> {
    template_dir: PathBuf,
    options: DeploymentOptions,
    templater: T,
    verify_data_dirs_empty: bool,
}

impl<T: ExternalTemplater> UnmanagedDeployer<T> {
    pub fn new(template_dir: impl Into<PathBuf>, options: DeploymentOptions, templater: T) -> Self {
        UnmanagedDeployer {
            template_dir: template_dir.into(),
            options,
            templater,
            verify_data_dirs_empty: true,
        }
    }

    /// Whether non-empty data directories abort the install. On by default.
    pub fn verify_data_dirs_empty(mut self, verify: bool) -> Self {
        self.verify_data_dirs_empty = verify;
        self
    }

    /// Check the node's directories and ports, then template the install into `basedir`.
    ///
    /// The node advertises its listen address for client connections and, unless other seeds
    /// were given, is its own seed. A `basedir` that holds a completed install is left as is,
    /// and the marker is written only after the install succeeded.
    pub fn install(&self) -> Result<DeploymentOptions> {
        let mut opts = self.options.clone();
        let basedir = opts
            .basedir()
            .map(PathBuf::from)
            .ok_or_else(|| cluster::missing("basedir"))?;
        let address = opts
            .listen_address()
            .map(str::to_string)
            .ok_or_else(|| cluster::missing("listen.address"))?;
        opts.set_rpc_address(address.as_str())
            .set_seeds(address.as_str())
            .set_data_dir(cluster::path_string(&basedir.join("data")))
            .set_commit_log_dir(cluster::path_string(&basedir.join("commit_log")))
            .set_saved_caches_dir(cluster::path_string(&basedir.join("saved_caches")));

        let marker = basedir.join(INSTALLED_MARKER);
        if marker.exists() {
            info!(
                "Node already installed in '{}', skipping installation",
                basedir.display()
            );
            return Ok(opts);
        }

        if address.starts_with("127.") || address == "localhost" {
            warn!(
                "This node is bound to the loopback address {address}; it will only be \
                 reachable from this machine"
            );
        }

        if self.verify_data_dirs_empty {
            let dirs = [
                ("commit log", opts.commit_log_dir()),
                ("data", opts.data_dir()),
                ("saved caches", opts.saved_caches_dir()),
            ];
            for (name, dir) in dirs {
                if let Some(dir) = dir {
                    check_dir_empty(name, Path::new(dir))?;
                }
            }
        }

        let ports = [
            ("jmx.port", opts.jmx_port()),
            ("native-transport-port", opts.native_transport_port()),
            ("storage.port", opts.storage_port()),
        ];
        for (name, port) in ports {
            if let Some(port) = port {
                check_port_free(&address, port, name)?;
            }
        }

        fs::create_dir_all(&basedir).map_err(|e| CcmError::deployment(&basedir, e))?;
        let bag = property_bag(&opts, 0, &self.template_dir, &basedir);
        self.templater.render(&self.template_dir, &basedir, &bag)?;

        let deployer = Deployer::new(&self.template_dir, opts);
        deployer.update_storage_auth_conf(&[address])?;
        fs::write(&marker, [0u8]).map_err(|e| CcmError::deployment(&marker, e))?;
        info!("Installed standalone node in '{}'", basedir.display());
        Ok(deployer.options().clone())
    }
}

/// Launch an installed standalone node from its `basedir`.
///
/// With `check_status`, block until the node accepts client connections and fail if it does
/// not within the retry budget of `init`. The launcher's output is in `logs/launcher.log`.
pub fn start_standalone<P: ProcessControl, C: NodeConnector>(
    options: &DeploymentOptions,
    process_control: &P,
    init: &ClusterInitService<C>,
    check_status: bool,
) -> Result<Box<dyn NodeProcess>> {
    let basedir = options
        .basedir()
        .map(PathBuf::from)
        .ok_or_else(|| cluster::missing("basedir"))?;
    let address = options
        .rpc_address()
        .or(options.listen_address())
        .ok_or_else(|| cluster::missing("listen.address"))?;
    let client_port = options.rpc_port().ok_or_else(|| cluster::missing("rpc-port"))?;
    let native_port = options
        .native_transport_port()
        .ok_or_else(|| cluster::missing("native-transport-port"))?;
    let node = CassandraNode::new(address, client_port, native_port);

    let command = LaunchCommand::for_node(&basedir);
    let handle = process_control.start(&command).map_err(|e| {
        CcmError::ProcessControl(format!(
            "could not launch '{}': {e}",
            command.program.display()
        ))
    })?;
    info!("Started standalone node {node} with pid {}", handle.id());

    if check_status {
        init.wait_for_cluster_to_start(std::slice::from_ref(&node), 1)
            .map_err(|e| {
                warn!(
                    "Could not verify that {node} is up; check '{}' for errors",
                    command.log_file.display()
                );
                e
            })?;
        info!("Standalone node {node} is up and accepting client connections");
    }
    Ok(handle)
}

fn check_dir_empty(name: &str, dir: &Path) -> Result<()> {
    let mut entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CcmError::deployment(dir, e)),
    };
    if entries.next().is_some() {
        return Err(CcmError::Preflight(format!(
            "the {name} directory '{}' is not empty",
            dir.display()
        )));
    }
    Ok(())
}

fn check_port_free(address: &str, port: u16, name: &str) -> Result<()> {
    match TcpListener::bind((address, port)) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => Err(CcmError::Preflight(format!(
            "the {name} ({address}:{port}) is already in use"
        ))),
        Err(e) => {
            warn!("could not check the {name} ({address}:{port}): {e}");
            Ok(())
        }
    }
}
