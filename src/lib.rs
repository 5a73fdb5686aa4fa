// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod agent;
pub mod bootstrap;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod deployer;
pub mod error;
pub mod init;
pub mod node;
pub mod options;
pub mod process;
pub mod protocol;
pub mod ring;
pub mod template;
pub mod test_env;

/// The properties file to load when none is given on the command line.
pub fn default_config_path() -> Option<String> {
    std::env::var("CCM_CONFIG").ok().filter(|p| !p.is_empty())
}

/// The node template to install from when none is given on the command line.
pub fn default_template_path() -> Option<String> {
    std::env::var("CCM_TEMPLATE").ok().filter(|p| !p.is_empty())
}

/// Log to stderr at `default_level`, unless CCM_LOG holds a filter directive.
pub fn init_logging(default_level: tracing_subscriber::filter::LevelFilter) {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("CCM_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
