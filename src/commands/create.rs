// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::commands::*;

pub fn create(cli: &Cli) -> HandledResult<()> {
    let mut manager = cluster_manager(cli)?;
    if template_dir(cli).is_none() && !manager.is_cluster_installed() {
        eprintln!(
            "A node template is required to create a cluster; pass --template or set \
             CCM_TEMPLATE."
        );
        return handled_error();
    }

    let nodes = manager
        .create_cluster()
        .handle_err(|e| eprintln!("Could not create cluster: {e}"))?;

    for (ordinal, node) in nodes.iter().enumerate() {
        println!("node{ordinal} {node}");
    }
    Ok(())
}
