// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{commands::*, protocol::NodeClient};

#[derive(Args, Debug, Clone)]
pub struct SchemaArgs {
    /// Block until every node agrees on one schema version.
    #[arg(long)]
    pub wait: bool,
}

pub fn schema(cli: &Cli, args: &SchemaArgs) -> HandledResult<()> {
    let manager = installed_cluster(cli)?;
    let nodes = manager.cluster_nodes();
    let init = manager.init_service();

    if args.wait {
        init.wait_for_schema_agreement(&nodes)
            .handle_err(|e| eprintln!("Could not wait for schema agreement: {e}"))?;
    }

    let Some(first) = nodes.first() else {
        return Ok(());
    };
    let mut client = NodeClient::connect(first, init.settings().connect_timeout)
        .handle_err(|e| eprintln!("{e}"))?;
    let versions = client
        .describe_schema_versions()
        .handle_err(|e| eprintln!("Could not describe schema versions: {e}"))?;

    for (version, hosts) in versions {
        println!("{version}: [{}]", hosts.join(", "));
    }
    Ok(())
}
