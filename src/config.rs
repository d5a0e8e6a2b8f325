//! Cluster and storage configuration
//!
//! Built-in defaults are embedded in the binary and merged with an optional user file. Cluster
//! entries of the user file replace built-in entries with the same key.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Environment variable pointing at a user configuration file
pub const CONFIG_ENV_VAR: &str = "SLURMFERRY_CONFIG";
const APP_DIR_NAME: &str = "slurmferry";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("can't read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("configuration {path} is not valid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("built-in configuration is not valid: {0}")]
    Defaults(#[source] serde_json::Error),
}

/// Connection settings of one cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Hostname or ssh alias
    pub host: String,
    /// Root of job folders on the cluster, `~/slurmferry` when unset
    pub remote_path: Option<String>,
    pub user: Option<String>,
    pub default_partition: Option<String>,
    pub account: Option<String>,
}

/// How commands reach the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshEngine {
    /// The `ssh` and `scp` binaries installed on this machine
    #[default]
    Subprocess,
    /// In-process ssh client
    Library,
}

/// Content of a configuration file, every field optional
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    local_path: Option<String>,
    remote_path: Option<String>,
    ssh_engine: Option<SshEngine>,
    poll_interval_secs: Option<u64>,
    #[serde(default)]
    clusters: BTreeMap<String, ClusterConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Local root holding `jobs/`
    pub local_path: PathBuf,
    /// Remote root used by clusters without their own `remote_path`
    pub remote_path: Option<String>,
    pub ssh_engine: SshEngine,
    /// Delay between two status queries while waiting for a job
    pub poll_interval: Duration,
    pub clusters: BTreeMap<String, ClusterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            local_path: default_local_path(),
            remote_path: None,
            ssh_engine: SshEngine::default(),
            poll_interval: Duration::from_secs(1),
            clusters: BTreeMap::new(),
        }
    }
}

fn default_local_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Expand a leading `~/` against the local home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

impl Config {
    /// Load built-in defaults merged with the user file
    ///
    /// The user file is `path` if given, else `$SLURMFERRY_CONFIG`, else
    /// `<config dir>/slurmferry/config.json`. A missing default location is not an error.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        static DEFAULTS: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/config/defaults.json"));
        let defaults: FileConfig = serde_json::from_str(DEFAULTS).map_err(ConfigError::Defaults)?;
        let mut config = Config::default().merge(defaults);

        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));
        let user_path = explicit.clone().or_else(|| {
            dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
        });

        if let Some(user_path) = user_path {
            match fs::read_to_string(&user_path) {
                Ok(json) => {
                    info!("Reading configuration {}", user_path.display());
                    let user: FileConfig =
                        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
                            path: user_path.clone(),
                            source,
                        })?;
                    config = config.merge(user);
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound && explicit.is_none() => {}
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: user_path,
                        source,
                    })
                }
            }
        }
        Ok(config)
    }

    /// Overlay a file on top of this configuration
    fn merge(mut self, file: FileConfig) -> Config {
        if let Some(local_path) = file.local_path {
            self.local_path = expand_home(&local_path);
        }
        if file.remote_path.is_some() {
            self.remote_path = file.remote_path;
        }
        if let Some(engine) = file.ssh_engine {
            self.ssh_engine = engine;
        }
        if let Some(secs) = file.poll_interval_secs {
            self.poll_interval = Duration::from_secs(secs);
        }
        self.clusters.extend(file.clusters);
        self
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterConfig> {
        self.clusters.get(name)
    }

    /// Configured remote root of a cluster, `None` if it has to be derived from the remote home
    pub fn remote_root(&self, cluster: &str) -> Option<String> {
        self.clusters
            .get(cluster)
            .and_then(|c| c.remote_path.clone())
            .or_else(|| self.remote_path.clone())
    }

    /// Local root, created if missing
    pub fn local_root(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.local_path)?;
        Ok(self.local_path.clone())
    }

    /// Default remote root below a remote home directory
    pub fn remote_root_in_home(home: &str) -> String {
        format!("{}/{}", home.trim_end_matches('/'), APP_DIR_NAME)
    }
}
