// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use ccm_lib::commands::{self, Cli};

/// The ccm binary creates, starts, stops, and inspects a local cluster.
fn main() {
    let args = Cli::parse();

    let level = if args.verbose {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    };
    ccm_lib::init_logging(level);

    if commands::main(&args).is_err() {
        std::process::exit(1);
    }
}
