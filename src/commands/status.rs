// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::commands::*;

pub fn status(cli: &Cli) -> HandledResult<()> {
    let manager = installed_cluster(cli)?;
    let init = manager.init_service();

    let nodes = manager.cluster_nodes();
    let mut up = 0;
    for (ordinal, (node, jmx_port)) in nodes.iter().zip(manager.jmx_ports()).enumerate() {
        let status = if init.ping(std::slice::from_ref(node), 1) {
            up += 1;
            "UP"
        } else {
            "DOWN"
        };
        println!("node{ordinal} {node} jmx={jmx_port}: {status}");
    }
    println!("{up} of {} nodes up", nodes.len());
    Ok(())
}
