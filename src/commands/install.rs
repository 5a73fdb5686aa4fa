// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::time::Duration;

use clap::Args;

use crate::{
    bootstrap::{start_standalone, BootstrapDeployer, CommandTemplater, UnmanagedDeployer},
    commands::*,
    init::{ClusterInitService, InitSettings},
    options::DeploymentOptions,
    process::{NodeProcess, OsProcessControl},
};

#[derive(Args, Debug, Clone)]
pub struct InstallArgs {
    /// Program that renders one node install. It is run as `PROG [ARGS...] <template> <dir>`
    /// with every property exported as CCM_PROP_<KEY>.
    #[arg(long)]
    pub tool: String,

    /// Extra arguments passed to the tool ahead of the directories.
    #[arg(long = "tool-arg", allow_hyphen_values = true)]
    pub tool_args: Vec<String>,

    /// Install a single standalone node into this directory instead of a cluster.
    #[arg(long)]
    pub standalone: Option<String>,

    /// Address the standalone node listens on.
    #[arg(long, default_value = "127.0.0.1")]
    pub address: String,

    /// Install even if the standalone node's data directories are not empty.
    #[arg(long)]
    pub skip_data_dir_check: bool,

    /// Launch the standalone node once it is installed.
    #[arg(long, requires = "standalone")]
    pub start: bool,

    /// After launching, wait until the node accepts client connections and fail if it does not.
    #[arg(long, requires = "start")]
    pub check_status: bool,
}

/// A short budget for confirming a freshly started standalone node.
fn standalone_check_settings() -> InitSettings {
    InitSettings {
        poll_delay: Duration::from_secs(3),
        settle_delay: Duration::ZERO,
        retries: 5,
        ..InitSettings::default()
    }
}

pub fn install(cli: &Cli, args: &InstallArgs) -> HandledResult<()> {
    let Some(template) = template_dir(cli) else {
        eprintln!(
            "A node template is required to install; pass --template or set CCM_TEMPLATE."
        );
        return handled_error();
    };
    let templater = args
        .tool_args
        .iter()
        .fold(CommandTemplater::new(&args.tool), |t, arg| t.arg(arg.as_str()));
    let defaults = load_options(cli)?;

    match &args.standalone {
        Some(basedir) => {
            let mut options = DeploymentOptions::new();
            options
                .set_basedir(basedir.as_str())
                .set_listen_address(args.address.as_str())
                .merge(&defaults);
            let deployer = UnmanagedDeployer::new(template, options, templater)
                .verify_data_dirs_empty(!args.skip_data_dir_check);
            let installed = deployer
                .install()
                .handle_err(|e| eprintln!("Could not install node: {e}"))?;
            println!("{basedir}");

            if args.start {
                let init = ClusterInitService::tcp(standalone_check_settings());
                let handle =
                    start_standalone(&installed, &OsProcessControl, &init, args.check_status)
                        .handle_err(|e| {
                            eprintln!("The node in '{basedir}' did not start: {e}");
                            eprintln!("Check '{basedir}/logs/launcher.log' for errors.");
                        })?;
                println!("started pid {}", handle.id());
            }
        }
        None => {
            let layout = BootstrapDeployer::new(template, defaults, templater)
                .deploy()
                .handle_err(|e| eprintln!("Could not install cluster: {e}"))?;
            for node in layout {
                println!("node{} {} token={}", node.ordinal, node.address, node.token);
            }
        }
    }
    Ok(())
}
