// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{fmt, str::FromStr};

use crate::error::CcmError;

/// The address of a running node: the host it binds to, its thrift-style client port, and its
/// native transport port.
///
/// Nodes are serialized in configuration as `host|thriftPort|nativeTransportPort`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CassandraNode {
    hostname: String,
    thrift_port: u16,
    native_transport_port: u16,
}

impl CassandraNode {
    pub fn new(hostname: &str, thrift_port: u16, native_transport_port: u16) -> Self {
        CassandraNode {
            hostname: hostname.to_string(),
            thrift_port,
            native_transport_port,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn thrift_port(&self) -> u16 {
        self.thrift_port
    }

    pub fn native_transport_port(&self) -> u16 {
        self.native_transport_port
    }

    /// The `host:port` form used to open client connections.
    pub fn client_address(&self) -> String {
        format!("{}:{}", self.hostname, self.thrift_port)
    }

    /// Parse a comma separated list of node strings.
    pub fn parse_list(nodes: &str) -> Result<Vec<Self>, CcmError> {
        nodes
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for CassandraNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}",
            self.hostname, self.thrift_port, self.native_transport_port
        )
    }
}

impl FromStr for CassandraNode {
    type Err = CcmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split('|').collect();
        let [host, thrift, native] = fields.as_slice() else {
            return Err(CcmError::InvalidNode(s.to_string()));
        };
        if host.is_empty() {
            return Err(CcmError::InvalidNode(s.to_string()));
        }
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|_| CcmError::InvalidNode(s.to_string()))
        };
        Ok(CassandraNode::new(host, parse_port(thrift)?, parse_port(native)?))
    }
}
