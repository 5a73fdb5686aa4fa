// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::commands::*;

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Block until every launched node accepts client connections.
    #[arg(long)]
    pub wait: bool,

    /// Only start these nodes, by ordinal. All nodes are started when none are given.
    #[arg(long = "node")]
    pub nodes: Vec<usize>,
}

pub fn start(cli: &Cli, args: &StartArgs) -> HandledResult<()> {
    let mut manager = installed_cluster(cli)?;

    let result = if args.nodes.is_empty() {
        manager.start_cluster(args.wait)
    } else {
        manager.start_nodes(&args.nodes, args.wait)
    };
    result.handle_err(|e| eprintln!("Could not start cluster: {e}"))
}
