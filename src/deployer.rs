// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Materializes a single node install from a template tree.
//!
//! A template is an unpacked distribution: `conf/rhq.<name>` files are configuration templates
//! that are rendered to `conf/<name>`, `conf/cassandra-jvm.properties` holds the JVM flags, and
//! everything under `bin/` must be executable.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use {
    tracing::{debug, info},
    walkdir::WalkDir,
};

use crate::{
    error::{CcmError, Result},
    options::DeploymentOptions,
    template,
};

/// The fixed cluster name substituted into every template.
pub const CLUSTER_NAME: &str = "ccm";

/// Prefix that marks a file under `conf/` as a template.
pub const TEMPLATE_PREFIX: &str = "rhq.";

pub const JVM_PROPERTIES: &str = "cassandra-jvm.properties";

pub const STORAGE_AUTH_CONF: &str = "rhq-storage-auth.conf";

#[derive(Debug, Clone)]
pub struct Deployer {
    template_dir: PathBuf,
    options: DeploymentOptions,
}

impl Deployer {
    pub fn new(template_dir: impl Into<PathBuf>, options: DeploymentOptions) -> Self {
        Deployer {
            template_dir: template_dir.into(),
            options,
        }
    }

    pub fn options(&self) -> &DeploymentOptions {
        &self.options
    }

    /// Replace the options used for subsequent steps, e.g. when moving on to the next node.
    pub fn set_options(&mut self, options: DeploymentOptions) {
        self.options = options;
    }

    pub fn basedir(&self) -> Result<PathBuf> {
        self.options
            .basedir()
            .map(PathBuf::from)
            .ok_or_else(|| CcmError::Configuration("no basedir set for node".to_string()))
    }

    /// The tokens available to templates: every set option plus the cluster name.
    pub fn tokens(&self) -> BTreeMap<String, String> {
        let mut tokens = self.options.to_map();
        tokens.insert("cluster.name".to_string(), CLUSTER_NAME.to_string());
        tokens
    }

    /// Copy the template tree into the node's basedir.
    pub fn unpack_distro(&self) -> Result<()> {
        let basedir = self.basedir()?;
        if !self.template_dir.is_dir() {
            return Err(CcmError::deployment(
                &self.template_dir,
                io::Error::new(io::ErrorKind::NotFound, "template directory not found"),
            ));
        }

        info!(
            "Unpacking '{}' to '{}'",
            self.template_dir.display(),
            basedir.display()
        );
        fs::create_dir_all(&basedir).map_err(|e| CcmError::deployment(&basedir, e))?;

        for entry in WalkDir::new(&self.template_dir).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.template_dir).to_path_buf();
                CcmError::deployment(path, io::Error::from(e))
            })?;
            let relative = entry.path().strip_prefix(&self.template_dir).map_err(|_| {
                CcmError::deployment(entry.path(), io::Error::other("entry outside template"))
            })?;
            let target = basedir.join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).map_err(|e| CcmError::deployment(&target, e))?;
            } else {
                fs::copy(entry.path(), &target).map_err(|e| CcmError::deployment(&target, e))?;
            }
        }
        Ok(())
    }

    /// Render every `conf/rhq.<name>` template to `conf/<name>` and remove the template, patch
    /// the JVM options, and create the node's data directories.
    pub fn apply_config_changes(&self) -> Result<()> {
        let conf_dir = self.basedir()?.join("conf");
        let tokens = self.tokens();

        let entries = fs::read_dir(&conf_dir)
            .and_then(|dir| dir.collect::<io::Result<Vec<_>>>())
            .map_err(|e| CcmError::deployment(&conf_dir, e))?;
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(resolved_name) = name.strip_prefix(TEMPLATE_PREFIX) else {
                continue;
            };
            if resolved_name.is_empty() {
                continue;
            }

            let template_path = entry.path();
            let text = fs::read_to_string(&template_path)
                .map_err(|e| CcmError::deployment(&template_path, e))?;
            for key in template::unresolved(&text, &tokens) {
                debug!("'{}' leaves ${{{key}}} unresolved", template_path.display());
            }

            let resolved_path = conf_dir.join(resolved_name);
            fs::write(&resolved_path, template::substitute(&text, &tokens))
                .map_err(|e| CcmError::deployment(&resolved_path, e))?;
            fs::remove_file(&template_path).map_err(|e| CcmError::deployment(&template_path, e))?;
        }

        self.update_jvm_options()?;
        self.create_data_dirs()
    }

    /// Set the heap, stack, and JMX flags in `conf/cassandra-jvm.properties`.
    pub fn update_jvm_options(&self) -> Result<()> {
        let mut updates = Vec::new();
        if let Some(heap) = self.options.heap_size() {
            updates.push(("heap_min", format!("\"-Xms{heap}\"")));
            updates.push(("heap_max", format!("\"-Xmx{heap}\"")));
        }
        if let Some(new_size) = self.options.heap_new_size() {
            updates.push(("heap_new", format!("\"-Xmn{new_size}\"")));
        }
        if let Some(stack) = self.options.stack_size() {
            updates.push(("thread_stack_size", format!("\"-Xss{stack}\"")));
        }
        if let Some(port) = self.options.jmx_port() {
            updates.push(("jmx_port", format!("\"{port}\"")));
        }
        if updates.is_empty() {
            return Ok(());
        }

        let path = self.basedir()?.join("conf").join(JVM_PROPERTIES);
        update_properties(&path, &updates)
    }

    /// Let JMX clients on other hosts reach this node by advertising `address` to RMI.
    pub fn update_remote_jmx(&self, address: &str) -> Result<()> {
        let path = self.basedir()?.join("conf").join(JVM_PROPERTIES);
        update_properties(
            &path,
            &[(
                "java_rmi_server_hostname",
                format!("\"-Djava.rmi.server.hostname={address}\""),
            )],
        )
    }

    /// Write the list of addresses permitted to talk to this node, one per line.
    pub fn update_storage_auth_conf(&self, addresses: &[String]) -> Result<()> {
        let conf_dir = self.basedir()?.join("conf");
        fs::create_dir_all(&conf_dir).map_err(|e| CcmError::deployment(&conf_dir, e))?;
        let path = conf_dir.join(STORAGE_AUTH_CONF);
        let mut contents = addresses.join("\n");
        contents.push('\n');
        fs::write(&path, contents).map_err(|e| CcmError::deployment(&path, e))
    }

    /// Make every file in `bin/` executable.
    pub fn update_file_perms(&self) -> Result<()> {
        let bin_dir = self.basedir()?.join("bin");
        let entries = match fs::read_dir(&bin_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no bin directory in '{}'", bin_dir.display());
                return Ok(());
            }
            Err(e) => return Err(CcmError::deployment(&bin_dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| CcmError::deployment(&bin_dir, e))?;
            let path = entry.path();
            if path.is_file() {
                make_executable(&path).map_err(|e| CcmError::deployment(&path, e))?;
            }
        }
        Ok(())
    }

    fn create_data_dirs(&self) -> Result<()> {
        let dirs = [
            self.options.data_dir(),
            self.options.commit_log_dir(),
            self.options.saved_caches_dir(),
        ];
        for dir in dirs.into_iter().flatten() {
            fs::create_dir_all(dir).map_err(|e| CcmError::deployment(dir, e))?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Set `key=value` for each update in a properties file. Existing keys are replaced in place,
/// missing ones are appended, and every other line is kept as is. A missing file is created.
pub fn update_properties(path: &Path, updates: &[(&str, String)]) -> Result<()> {
    let existing = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(CcmError::deployment(path, e)),
    };

    let mut applied = vec![false; updates.len()];
    let mut lines: Vec<String> = existing
        .lines()
        .map(|line| {
            let Some(key) = property_key(line) else {
                return line.to_string();
            };
            match updates.iter().position(|(k, _)| *k == key) {
                Some(i) => {
                    applied[i] = true;
                    format!("{}={}", updates[i].0, updates[i].1)
                }
                None => line.to_string(),
            }
        })
        .collect();

    for (i, (key, value)) in updates.iter().enumerate() {
        if !applied[i] {
            lines.push(format!("{key}={value}"));
        }
    }

    let mut contents = lines.join("\n");
    contents.push('\n');
    fs::write(path, contents).map_err(|e| CcmError::deployment(path, e))
}

/// The key of a `key=value` or `key: value` line, or None for blank lines and comments.
fn property_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
        return None;
    }
    let end = trimmed.find(['=', ':']).unwrap_or(trimmed.len());
    Some(trimmed[..end].trim_end())
}
