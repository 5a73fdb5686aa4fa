// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::commands::*;

pub fn stop(cli: &Cli) -> HandledResult<()> {
    let mut manager = installed_cluster(cli)?;
    manager
        .shutdown_cluster()
        .handle_err(|e| eprintln!("Could not stop cluster: {e}"))
}
