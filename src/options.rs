// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Deployment options for a single node, or the cluster-wide defaults applied to every node.
//!
//! Options are "sticky": once a field holds a value, setting it again is a no-op. Per-node
//! values are therefore set first, and the cluster-wide defaults are layered underneath with
//! [`DeploymentOptions::merge`] or [`DeploymentOptions::load`], which only fill empty fields.

use std::collections::BTreeMap;

use crate::{
    config::OptionsLoader,
    error::{CcmError, Result},
};

macro_rules! deployment_options {
    (
        strings {
            $( $(#[$sdoc:meta])* $sfield:ident, $sset:ident => $skey:literal; )*
        }
        values {
            $( $(#[$vdoc:meta])* $vfield:ident: $vty:ty, $vset:ident => $vkey:literal; )*
        }
    ) => {
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct DeploymentOptions {
            loaded: bool,
            $( $sfield: Option<String>, )*
            $( $vfield: Option<$vty>, )*
        }

        impl DeploymentOptions {
            $(
                $(#[$sdoc])*
                pub fn $sfield(&self) -> Option<&str> {
                    self.$sfield.as_deref()
                }

                pub fn $sset(&mut self, value: impl Into<String>) -> &mut Self {
                    if self.$sfield.is_none() {
                        self.$sfield = Some(value.into());
                    }
                    self
                }
            )*

            $(
                $(#[$vdoc])*
                pub fn $vfield(&self) -> Option<$vty> {
                    self.$vfield
                }

                pub fn $vset(&mut self, value: $vty) -> &mut Self {
                    if self.$vfield.is_none() {
                        self.$vfield = Some(value);
                    }
                    self
                }
            )*

            /// Fill every unset field from `other`. Fields already set here are never
            /// overwritten.
            pub fn merge(&mut self, other: &DeploymentOptions) -> &mut Self {
                $(
                    if self.$sfield.is_none() {
                        self.$sfield = other.$sfield.clone();
                    }
                )*
                $(
                    if self.$vfield.is_none() {
                        self.$vfield = other.$vfield;
                    }
                )*
                self
            }

            /// The template tokens for every field that holds a value, keyed by property name.
            pub fn to_map(&self) -> BTreeMap<String, String> {
                let mut map = BTreeMap::new();
                $(
                    if let Some(v) = &self.$sfield {
                        map.insert($skey.to_string(), v.clone());
                    }
                )*
                $(
                    if let Some(v) = &self.$vfield {
                        map.insert($vkey.to_string(), v.to_string());
                    }
                )*
                map
            }

            /// Every property key known to the options.
            pub fn keys() -> &'static [&'static str] {
                &[ $( $skey, )* $( $vkey, )* ]
            }

            fn fill_from(&mut self, loader: &OptionsLoader) -> Result<()> {
                let props = loader.properties()?;
                $(
                    if let Some(v) = loader.resolve($skey, &props) {
                        self.$sset(v);
                    }
                )*
                $(
                    if let Some(v) = loader.resolve($vkey, &props) {
                        let parsed = v.trim().parse::<$vty>().map_err(|e| {
                            CcmError::Configuration(format!(
                                "invalid value '{v}' for property '{}': {e}",
                                $vkey
                            ))
                        })?;
                        self.$vset(parsed);
                    }
                )*
                Ok(())
            }
        }
    };
}

deployment_options! {
    strings {
        /// The directory in which the nodes of a local cluster are installed.
        cluster_dir, set_cluster_dir => "cluster.dir";
        /// The directory in which this node is installed.
        basedir, set_basedir => "basedir";
        logging_level, set_logging_level => "logging.level";
        /// The user clients authenticate as.
        username, set_username => "username";
        password, set_password => "password";
        authenticator, set_authenticator => "authenticator";
        authorizer, set_authorizer => "authorizer";
        data_dir, set_data_dir => "data.dir";
        commit_log_dir, set_commit_log_dir => "commitlog.dir";
        saved_caches_dir, set_saved_caches_dir => "saved.caches.dir";
        log_file, set_log_file => "log.file";
        /// The address the node binds to and advertises to its peers.
        listen_address, set_listen_address => "listen.address";
        rpc_address, set_rpc_address => "rpc.address";
        /// Comma separated contact points used to learn the ring at startup.
        seeds, set_seeds => "seeds";
        /// Passed to both -Xms and -Xmx.
        heap_size, set_heap_size => "max.heap.size";
        /// Passed to -Xmn.
        heap_new_size, set_heap_new_size => "heap.new.size";
        /// Passed to -Xss.
        stack_size, set_stack_size => "stack.size";
        /// The node's position on the ring. Held as a string since tokens exceed 64 bits.
        initial_token, set_initial_token => "initial.token";
    }
    values {
        num_nodes: usize, set_num_nodes => "num-nodes";
        /// True when every node runs on this host and only accepts local connections.
        embedded: bool, set_embedded => "embedded";
        /// Milliseconds to wait for gossip to settle before serving.
        ring_delay: u64, set_ring_delay => "ring.delay";
        num_tokens: u32, set_num_tokens => "num-tokens";
        native_transport_port: u16, set_native_transport_port => "native-transport-port";
        start_rpc: bool, set_start_rpc => "start-rpc";
        rpc_port: u16, set_rpc_port => "rpc-port";
        native_transport_max_threads: u32,
            set_native_transport_max_threads => "native-transport-max-threads";
        jmx_port: u16, set_jmx_port => "jmx.port";
        /// Gossip port.
        storage_port: u16, set_storage_port => "storage.port";
        ssl_storage_port: u16, set_ssl_storage_port => "ssl.storage.port";
    }
}

impl DeploymentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize every unset field from `loader`. An override registered on the loader (or
    /// taken from the environment) wins over the value in the properties source.
    ///
    /// Loading twice is a no-op. A source that cannot be read is reported to the caller rather
    /// than silently defaulted.
    pub fn load(&mut self, loader: &OptionsLoader) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        self.fill_from(loader)?;
        self.loaded = true;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropertiesSource;

    #[test]
    fn setters_are_sticky() {
        let mut opts = DeploymentOptions::new();
        opts.set_cluster_dir("/first").set_cluster_dir("/second");
        opts.set_rpc_port(9160).set_rpc_port(9999);
        assert_eq!(opts.cluster_dir(), Some("/first"));
        assert_eq!(opts.rpc_port(), Some(9160));
    }

    #[test]
    fn merge_only_fills_unset_fields() {
        let mut node = DeploymentOptions::new();
        node.set_seeds("127.0.0.2").set_jmx_port(7201);

        let mut global = DeploymentOptions::new();
        global
            .set_seeds("10.0.0.1")
            .set_jmx_port(7200)
            .set_heap_size("512M");

        node.merge(&global);
        assert_eq!(node.seeds(), Some("127.0.0.2"));
        assert_eq!(node.jmx_port(), Some(7201));
        assert_eq!(node.heap_size(), Some("512M"));
    }

    #[test]
    fn merge_order_does_not_matter_for_set_fields() {
        let mut b = DeploymentOptions::new();
        b.set_cluster_dir("/b").set_num_nodes(2);
        let mut c = DeploymentOptions::new();
        c.set_cluster_dir("/c").set_stack_size("256k");

        let mut base = DeploymentOptions::new();
        base.set_cluster_dir("/a").set_rpc_port(9160);

        let mut first = base.clone();
        first.merge(&b).merge(&c);
        let mut second = base.clone();
        second.merge(&c).merge(&b);

        assert_eq!(first, second);
        assert_eq!(first.cluster_dir(), Some("/a"));
    }

    #[test]
    fn load_respects_explicit_values_and_overrides() {
        let loader = OptionsLoader::new(PropertiesSource::Inline(
            "\"cluster.dir\" = \"/from/source\"\n\"rpc-port\" = 9160\n\"jmx.port\" = 7200\n"
                .to_string(),
        ))
        .with_override("jmx.port", "7300");

        let mut opts = DeploymentOptions::new();
        opts.set_cluster_dir("/explicit");
        opts.load(&loader).unwrap();

        assert_eq!(opts.cluster_dir(), Some("/explicit"));
        assert_eq!(opts.rpc_port(), Some(9160));
        assert_eq!(opts.jmx_port(), Some(7300));
        assert!(opts.is_loaded());
    }

    #[test]
    fn load_reports_bad_values() {
        let loader = OptionsLoader::new(PropertiesSource::Inline(
            "\"num-nodes\" = \"many\"\n".to_string(),
        ));
        let err = DeploymentOptions::new().load(&loader).unwrap_err();
        assert!(err.to_string().contains("num-nodes"));
    }

    #[test]
    fn to_map_contains_only_set_fields() {
        let mut opts = DeploymentOptions::new();
        opts.set_listen_address("127.0.0.1").set_num_tokens(256);
        let map = opts.to_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map["listen.address"], "127.0.0.1");
        assert_eq!(map["num-tokens"], "256");
        assert!(DeploymentOptions::keys().contains(&"ssl.storage.port"));
    }
}
