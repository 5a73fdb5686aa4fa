// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::{CcmError, Result};

/// The default properties shipped with the crate.
pub const BUNDLED_PROPERTIES: &str = include_str!("../resources/ccm.toml");

/// Where the base deployment properties come from.
#[derive(Debug, Clone)]
pub enum PropertiesSource {
    /// The defaults compiled into the crate.
    Bundled,
    /// A TOML file on disk.
    File(PathBuf),
    /// TOML text held in memory.
    Inline(String),
}

/// Loads deployment properties from a [`PropertiesSource`], preferring process-level overrides
/// over the value held in the source for every key.
///
/// A loader is handed to whatever needs to populate a [`crate::options::DeploymentOptions`]; no
/// component reaches for the environment on its own.
#[derive(Debug, Clone)]
pub struct OptionsLoader {
    source: PropertiesSource,
    overrides: HashMap<String, String>,
}

impl OptionsLoader {
    /// A loader with no overrides at all.
    pub fn new(source: PropertiesSource) -> Self {
        OptionsLoader {
            source,
            overrides: HashMap::new(),
        }
    }

    /// A loader whose overrides are taken from `CCM_*` environment variables.
    pub fn from_env(source: PropertiesSource) -> Self {
        let overrides = std::env::vars()
            .filter(|(k, _)| k.starts_with("CCM_"))
            .collect();
        OptionsLoader { source, overrides }
    }

    /// Register an explicit override for the property `key`.
    pub fn with_override(mut self, key: &str, value: &str) -> Self {
        self.overrides.insert(override_name(key), value.to_string());
        self
    }

    pub fn source(&self) -> &PropertiesSource {
        &self.source
    }

    /// Read the source and resolve every key it names against the overrides. Use
    /// [`OptionsLoader::resolve`] for keys the source may leave out.
    pub fn properties(&self) -> Result<HashMap<String, String>> {
        let text = match &self.source {
            PropertiesSource::Bundled => BUNDLED_PROPERTIES.to_string(),
            PropertiesSource::Inline(text) => text.clone(),
            PropertiesSource::File(path) => read_source(path)?,
        };
        let mut props = parse_properties(&text)?;

        for (key, value) in props.iter_mut() {
            if let Some(over) = self.lookup_override(key) {
                debug!("property '{key}' overridden by {}", override_name(key));
                *value = over;
            }
        }

        Ok(props)
    }

    /// Resolve a single key, override first.
    pub fn resolve(&self, key: &str, props: &HashMap<String, String>) -> Option<String> {
        self.lookup_override(key)
            .or_else(|| props.get(key).cloned())
            .filter(|v| !v.is_empty())
    }

    fn lookup_override(&self, key: &str) -> Option<String> {
        self.overrides
            .get(&override_name(key))
            .filter(|v| !v.is_empty())
            .cloned()
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        warn!("Unable to load deployment options from '{}'", path.display());
        CcmError::Configuration(format!("could not read '{}': {e}", path.display()))
    })
}

/// The environment variable name that overrides `key`: `cluster.dir` becomes `CCM_CLUSTER_DIR`.
pub fn override_name(key: &str) -> String {
    let mut name = String::from("CCM_");
    name.extend(key.chars().map(|c| match c {
        '.' | '-' => '_',
        c => c.to_ascii_uppercase(),
    }));
    name
}

/// Parse a flat TOML table into string properties.
///
/// Strings, integers, floats and booleans are accepted; a nested table or array is a
/// configuration error since it cannot be used as a single property value.
pub fn parse_properties(text: &str) -> Result<HashMap<String, String>> {
    let table: toml::Table = toml::from_str(text)
        .map_err(|e| CcmError::Configuration(format!("could not parse properties: {e}")))?;

    table
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                toml::Value::String(s) => s,
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                toml::Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(CcmError::Configuration(format!(
                        "property '{key}' must be a scalar, found {}",
                        other.type_str()
                    )))
                }
            };
            Ok((key, value))
        })
        .collect()
}
