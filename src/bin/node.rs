// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use ccm_lib::agent::{self, Cli};

fn main() {
    ccm_lib::init_logging(LevelFilter::WARN);

    let args = Cli::parse();

    if agent::main(args).is_err() {
        std::process::exit(1);
    }
}
