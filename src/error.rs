// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors produced while deploying, starting, polling, or stopping a cluster.
///
/// Transient connectivity failures during startup are absorbed by the wait loops in
/// [`crate::init`] and only become a `CcmError` once a retry budget is exhausted.
#[derive(Error, Debug)]
pub enum CcmError {
    /// The properties source is missing, unreadable, or holds a value that does not parse.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A filesystem step of a node install failed.
    #[error("deployment failed at '{path}': {source}")]
    Deployment {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Installing one node of a multi-node cluster failed, aborting the whole create.
    #[error("failed to deploy node {ordinal} in '{dir}': {source}")]
    NodeDeployment {
        ordinal: usize,
        dir: PathBuf,
        #[source]
        source: Box<CcmError>,
    },

    /// The external templating tool exited unsuccessfully.
    #[error("templating tool '{program}' failed for '{dir}': {message}")]
    Templating {
        program: String,
        dir: PathBuf,
        message: String,
    },

    #[error(
        "unable to verify that {required} nodes are up after {attempts} failed attempts \
         ({confirmed} confirmed)"
    )]
    RetriesExceeded {
        attempts: u32,
        confirmed: usize,
        required: usize,
    },

    #[error("could not connect to {node}: {source}")]
    Connectivity {
        node: String,
        #[source]
        source: io::Error,
    },

    /// A standalone install found its directories or ports already in use.
    #[error("install cannot proceed: {0}")]
    Preflight(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("process control error: {0}")]
    ProcessControl(String),

    #[error("operation '{operation}' is not valid while the cluster is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("invalid node descriptor '{0}'")]
    InvalidNode(String),
}

impl CcmError {
    pub fn deployment(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CcmError::Deployment {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CcmError>;
