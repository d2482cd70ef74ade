//! Installer variables

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::result::{Error, Result};

const DEFAULT_ADMIN_PASSWORD: &str = "St8rlingX*";
const DEFAULT_LOG_DIR: &str = "~/stx_virsh_installer";

/// Deployment configuration of the lab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemMode {
    /// One all-in-one controller
    Simplex,
    /// Two all-in-one controllers
    Duplex,
    /// Two controllers with workers (`standard`)
    ControllerStorage,
    /// Controllers, workers and storage nodes (`storage`)
    DedicatedStorage,
}

impl SystemMode {
    /// Canonical name as used in VM names.
    pub fn as_str(self) -> &'static str {
        match self {
            SystemMode::Simplex => "simplex",
            SystemMode::Duplex => "duplex",
            SystemMode::ControllerStorage => "controllerstorage",
            SystemMode::DedicatedStorage => "dedicatedstorage",
        }
    }

    /// All-in-one modes, which have no dedicated workers or storage.
    pub fn is_plex(self) -> bool {
        matches!(self, SystemMode::Simplex | SystemMode::Duplex)
    }
}

impl FromStr for SystemMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "simplex" => Ok(SystemMode::Simplex),
            "duplex" => Ok(SystemMode::Duplex),
            "standard" | "controllerstorage" => Ok(SystemMode::ControllerStorage),
            "storage" | "dedicatedstorage" => Ok(SystemMode::DedicatedStorage),
            other => Err(Error::InvalidVar {
                key: "system_mode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Layout of the variable file. Section names match the old ini layout too.
#[derive(Debug, Default, Deserialize)]
struct VarFile {
    #[serde(default, alias = "VARIABLE")]
    variable: BTreeMap<String, toml::Value>,
    #[serde(default, alias = "FILE")]
    file: BTreeMap<String, toml::Value>,
    #[serde(default, alias = "URL")]
    url: BTreeMap<String, toml::Value>,
    #[serde(default, alias = "LOG_LOCATION")]
    log_location: BTreeMap<String, toml::Value>,
}

fn flatten(key: &str, value: &toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(true) => Ok("True".to_string()),
        toml::Value::Boolean(false) => Ok("False".to_string()),
        other => Err(Error::InvalidVar {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}

/// Expand a leading `~` to `$HOME`.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => {
            let mut expanded = PathBuf::from(home);
            expanded.push(rest.trim_start_matches('/'));
            expanded
        }
        _ => PathBuf::from(path),
    }
}

/// Flat string variables driving the installer.
///
/// Keys containing a `.` name files to copy to the primary node; all other
/// keys are plain settings. Values are strings; booleans read as
/// `"True"`/`"False"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarDict {
    vars: BTreeMap<String, String>,
}

impl VarDict {
    /// Parse a variable file.
    ///
    /// Empty `file` entries are dropped; the others have `~` expanded. An
    /// empty `base_log_dir` becomes `~/stx_virsh_installer`.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: VarFile = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        let mut dict = Self::default();

        for (key, value) in file.variable.iter().chain(&file.url) {
            dict.set(key, flatten(key, value)?);
        }
        for (key, value) in &file.file {
            let path = flatten(key, value)?;
            if !path.is_empty() {
                dict.set(key, expand_home(&path).to_string_lossy());
            }
        }
        for (key, value) in &file.log_location {
            dict.set(key, flatten(key, value)?);
        }

        let log_dir = dict.get_or("base_log_dir", "").to_string();
        let log_dir = if log_dir.is_empty() {
            DEFAULT_LOG_DIR
        } else {
            log_dir.as_str()
        };
        dict.set("base_log_dir", expand_home(log_dir).to_string_lossy());
        Ok(dict)
    }

    /// Read and parse a variable file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Apply `key=value` lines; lines without `=` are ignored.
    pub fn apply_overwrites(&mut self, content: &str) {
        for line in content.lines() {
            if let Some((key, value)) = line.trim().split_once('=') {
                debug!("Overwriting {key}");
                self.set(key.trim(), value.trim());
            }
        }
    }

    /// Apply an overwrite file, see [`apply_overwrites`](Self::apply_overwrites).
    pub fn apply_overwrite_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        self.apply_overwrites(&content);
        Ok(())
    }

    /// Value of a required variable.
    ///
    /// # Errors
    ///
    /// [`Error::MissingVar`] if it is not set.
    pub fn get(&self, key: &str) -> Result<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| Error::MissingVar(key.to_string()))
    }

    /// Value of an optional variable.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.vars.get(key).map_or(default, String::as_str)
    }

    /// Set a variable.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Whether a flag variable is `"True"`.
    ///
    /// # Errors
    ///
    /// [`Error::MissingVar`] if it is not set.
    pub fn flag(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)? == "True")
    }

    /// A non-negative count.
    pub fn count(&self, key: &str) -> Result<usize> {
        let value = self.get_or(key, "0");
        value.trim().parse().map_err(|_| Error::InvalidVar {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// The configured system mode.
    pub fn system_mode(&self) -> Result<SystemMode> {
        self.get("system_mode")?.parse()
    }

    /// Canonicalise the variables before a run.
    ///
    /// Mode aliases become their canonical names, the VM prefix gets its
    /// trailing `-`, node counts are forced to what the mode allows and the
    /// admin password gets its default.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidVar`] for an unsupported mode.
    pub fn normalize(&mut self) -> Result<()> {
        let mode = self.system_mode()?;
        self.set("system_mode", mode.as_str());

        let prefix = self.get_or("vm_name_prefix", "").to_string();
        if !prefix.is_empty() && !prefix.ends_with('-') {
            self.set("vm_name_prefix", format!("{prefix}-"));
        }

        if mode == SystemMode::Simplex {
            self.set("num_of_controller", "1");
        }
        if mode.is_plex() {
            self.set("num_of_compute", "0");
            self.set("num_of_storage", "0");
        }
        if mode == SystemMode::ControllerStorage {
            self.set("num_of_storage", "0");
        }

        if self.get_or("admin_password", "").is_empty() {
            self.set("admin_password", DEFAULT_ADMIN_PASSWORD);
        }
        Ok(())
    }

    /// Libvirt domain names of every node, controllers first.
    pub fn node_names(&self) -> Result<Vec<String>> {
        let mode = self.system_mode()?;
        let prefix = self.get_or("vm_name_prefix", "");

        let mut names = Vec::new();
        for (role, key) in [
            ("controller", "num_of_controller"),
            ("worker", "num_of_compute"),
            ("storage", "num_of_storage"),
        ] {
            for i in 0..self.count(key)? {
                names.push(format!("{prefix}{mode}-{role}-{i}"));
            }
        }
        Ok(names)
    }

    /// Files to copy to the primary node, as `(file name, local path)`.
    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .filter(|(key, _)| key.contains('.'))
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// All variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for VarDict {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut dict = Self::default();
        for (key, value) in iter {
            dict.set(key, value);
        }
        dict
    }
}
