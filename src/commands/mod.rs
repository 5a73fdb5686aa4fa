// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod create;
pub mod install;
pub mod schema;
pub mod start;
pub mod status;
pub mod stop;

use std::path::PathBuf;

use {install::InstallArgs, schema::SchemaArgs, start::StartArgs};

use clap::{Parser, Subcommand};

use crate::{
    cluster::ClusterManager,
    config::{OptionsLoader, PropertiesSource},
    init::{ClusterInitService, InitSettings},
    options::DeploymentOptions,
};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must return a nonzero exit status when it gets a `HandledError`.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
///
/// A `HandledError` intentionally has no data about what the specific error was; the process of
/// handling the error "consumes" that information, and it is no longer needed as the error was
/// already appropriately handled.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error() -> HandledResult<()> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Properties file; the bundled defaults are used when neither this nor CCM_CONFIG is set.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// The unpacked node distribution every node is installed from.
    #[arg(long, global = true)]
    pub template: Option<String>,

    #[arg(long, global = true)]
    pub cluster_dir: Option<String>,

    #[arg(long, global = true)]
    pub nodes: Option<usize>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install every node of the cluster.
    Create,
    /// Launch every node.
    Start(StartArgs),
    /// Signal every node to stop.
    Stop,
    /// Report which nodes accept connections.
    Status,
    /// Report the schema versions in use across the cluster.
    Schema(SchemaArgs),
    /// Install nodes through an external templating tool.
    Install(InstallArgs),
}

/// The cluster wide options: command line values first, then overrides from the environment,
/// then the properties source.
pub fn load_options(cli: &Cli) -> HandledResult<DeploymentOptions> {
    let source = match cli.config.clone().or_else(crate::default_config_path) {
        Some(path) => PropertiesSource::File(PathBuf::from(path)),
        None => PropertiesSource::Bundled,
    };

    let mut options = DeploymentOptions::new();
    if let Some(dir) = &cli.cluster_dir {
        options.set_cluster_dir(dir.as_str());
    }
    if let Some(nodes) = cli.nodes {
        options.set_num_nodes(nodes);
    }

    options
        .load(&OptionsLoader::from_env(source))
        .handle_err(|e| eprintln!("Could not load deployment options: {e}"))?;
    Ok(options)
}

pub fn template_dir(cli: &Cli) -> Option<PathBuf> {
    cli.template
        .clone()
        .or_else(crate::default_template_path)
        .map(PathBuf::from)
}

/// A manager for the configured cluster. Without a template, only an installed cluster can be
/// managed.
pub fn cluster_manager(cli: &Cli) -> HandledResult<ClusterManager> {
    let options = load_options(cli)?;
    let template = template_dir(cli).unwrap_or_default();
    Ok(ClusterManager::with_defaults(
        template,
        options,
        ClusterInitService::tcp(InitSettings::default()),
    ))
}

/// A manager whose node descriptors have been computed from an existing install.
pub fn installed_cluster(cli: &Cli) -> HandledResult<ClusterManager> {
    let mut manager = cluster_manager(cli)?;
    if !manager.is_cluster_installed() {
        let dir = manager
            .options()
            .cluster_dir()
            .unwrap_or("<unset>")
            .to_string();
        eprintln!("No cluster is installed in '{dir}'; run 'ccm create' first.");
        handled_error()?;
    }
    manager
        .create_cluster()
        .handle_err(|e| eprintln!("Could not read cluster layout: {e}"))?;
    Ok(manager)
}

pub fn main(cli: &Cli) -> HandledResult<()> {
    match &cli.command {
        Commands::Create => create::create(cli),
        Commands::Start(args) => start::start(cli, args),
        Commands::Stop => stop::stop(cli),
        Commands::Status => status::status(cli),
        Commands::Schema(args) => schema::schema(cli, args),
        Commands::Install(args) => install::install(cli, args),
    }
}
