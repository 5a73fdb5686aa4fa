// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Ring layout: node addresses, initial tokens, and seed lists for an N node cluster.
//!
//! The whole layout is computed before any node is installed, so that every node's
//! configuration embeds the complete peer list.

use std::net::Ipv4Addr;

use crate::error::{CcmError, Result};

/// The size of the partitioner's token space, 2^127.
const TOKEN_SPACE: u128 = 1 << 127;

/// Identity of one node in the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub ordinal: usize,
    pub address: String,
    pub token: u128,
    /// Every other node's address, in ordinal order.
    pub seeds: Vec<String>,
}

impl NodeIdentity {
    /// The seeds as written into the node's configuration.
    ///
    /// A lone node has no peers; it is then its own seed, since a ring needs at least one.
    pub fn seeds_option(&self) -> String {
        if self.seeds.is_empty() {
            self.address.clone()
        } else {
            self.seeds.join(",")
        }
    }
}

/// The default address for node `ordinal`: `127.0.0.(ordinal + 1)`.
pub fn local_address(ordinal: usize) -> Result<String> {
    let last = u8::try_from(ordinal + 1)
        .ok()
        .filter(|b| *b < 255)
        .ok_or_else(|| {
            CcmError::Configuration(format!("no loopback address for node {ordinal}"))
        })?;
    Ok(Ipv4Addr::new(127, 0, 0, last).to_string())
}

/// The initial token of node `ordinal` in an evenly partitioned ring of `num_nodes`.
pub fn initial_token(ordinal: usize, num_nodes: usize) -> u128 {
    (TOKEN_SPACE / num_nodes as u128) * ordinal as u128
}

/// Addresses for `num_nodes` nodes, drawn positionally from `explicit` when it is given and
/// non-empty, otherwise from the loopback range.
pub fn node_addresses(num_nodes: usize, explicit: Option<&str>) -> Result<Vec<String>> {
    let explicit: Vec<String> = explicit
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if explicit.is_empty() {
        return (0..num_nodes).map(local_address).collect();
    }

    if explicit.len() < num_nodes {
        return Err(CcmError::Configuration(format!(
            "{num_nodes} nodes requested but only {} seed addresses were given",
            explicit.len()
        )));
    }
    let addresses: Vec<String> = explicit.into_iter().take(num_nodes).collect();
    for (i, address) in addresses.iter().enumerate() {
        if addresses[..i].contains(address) {
            return Err(CcmError::Configuration(format!(
                "seed address {address} is given for more than one node"
            )));
        }
    }
    Ok(addresses)
}

/// Compute the identity of every node of the ring.
pub fn layout(num_nodes: usize, explicit_seeds: Option<&str>) -> Result<Vec<NodeIdentity>> {
    if num_nodes == 0 {
        return Err(CcmError::Configuration(
            "a cluster needs at least one node".to_string(),
        ));
    }
    let addresses = node_addresses(num_nodes, explicit_seeds)?;

    Ok(addresses
        .iter()
        .enumerate()
        .map(|(ordinal, address)| NodeIdentity {
            ordinal,
            address: address.clone(),
            token: initial_token(ordinal, num_nodes),
            seeds: addresses
                .iter()
                .filter(|a| *a != address)
                .cloned()
                .collect(),
        })
        .collect())
}
