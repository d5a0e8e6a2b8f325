use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Arguments handed to the interpreter
///
/// A list turns the job into a slurm job array with one task per element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PythonArgs {
    #[default]
    None,
    /// Passed verbatim
    Literal(String),
    /// Rendered as `--key=value` flags, in insertion order
    Flags(Map<String, Value>),
    /// One task per entry
    Array(Vec<ArgLine>),
}

/// Arguments of a single task of a job array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgLine {
    Literal(String),
    Flags(Map<String, Value>),
}

impl ArgLine {
    pub fn render(&self) -> String {
        match self {
            ArgLine::Literal(line) => line.clone(),
            ArgLine::Flags(flags) => flatten_flags(flags),
        }
    }
}

/// `{"lr": 0.1, "name": "a"}` -> `--lr=0.1 --name=a`
pub fn flatten_flags(flags: &Map<String, Value>) -> String {
    flags
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("--{key}={s}"),
            other => format!("--{key}={other}"),
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Everything needed to create and submit one job
///
/// The descriptor is written unchanged into the job metadata. Field names on the wire are kept
/// stable so older metadata files can still be read; unknown fields are dropped and missing fields
/// take their default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDescriptor {
    /// Unique name, may contain `/` to group jobs in sub folders
    #[serde(rename = "jobname")]
    pub name: String,
    /// Script to run, relative to `src_dir`
    pub entrypoint: String,
    pub cluster: Option<String>,
    /// Shell snippet executed before the entrypoint
    pub bash_setup_command: Option<String>,
    /// Shipped to the cluster, defaults to the current directory
    pub src_dir: Option<String>,
    /// Overrides the cluster remote root
    pub remote_dir: Option<String>,
    /// Raw flags appended to the sbatch call
    pub sbatch_arguments: Option<String>,

    /// Interpreter for the entrypoint, `bash` is used when unset
    pub python_binary: Option<String>,
    pub python_args: PythonArgs,
    /// Max number of array tasks running at once, only valid for job arrays
    pub n_concurrent_jobs: Option<u32>,
    /// Paths existing on the cluster added to PYTHONPATH
    pub python_paths: Option<Vec<String>>,
    /// Local directories shipped with the job and added to PYTHONPATH
    pub python_libraries: Option<Vec<String>>,

    pub partition: Option<String>,
    pub n_cpus: Option<u32>,
    /// GPUs per node, zero means none
    pub n_gpus: Option<u32>,
    /// Memory in MB
    pub mem: Option<u64>,
    pub max_runtime_minutes: Option<u32>,
    pub account: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub nodes: Option<u32>,
    pub nodelist: Option<String>,
}

impl Default for JobDescriptor {
    fn default() -> Self {
        JobDescriptor {
            name: String::new(),
            entrypoint: String::new(),
            cluster: None,
            bash_setup_command: None,
            src_dir: None,
            remote_dir: None,
            sbatch_arguments: None,
            python_binary: None,
            python_args: PythonArgs::None,
            n_concurrent_jobs: None,
            python_paths: None,
            python_libraries: None,
            partition: None,
            n_cpus: Some(1),
            n_gpus: None,
            mem: None,
            max_runtime_minutes: Some(60),
            account: None,
            env: None,
            nodes: None,
            nodelist: None,
        }
    }
}

impl JobDescriptor {
    pub fn new(name: &str, entrypoint: &str) -> JobDescriptor {
        JobDescriptor {
            name: name.to_string(),
            entrypoint: entrypoint.to_string(),
            ..Default::default()
        }
    }

    pub fn is_job_array(&self) -> bool {
        matches!(self.python_args, PythonArgs::Array(_))
    }

    /// Check field combinations, no file system access
    pub fn validate(&self) -> Result<()> {
        let name = &self.name;
        if name.is_empty() {
            return Err(Error::invalid(name, "job name is empty"));
        }
        let path = Path::new(name);
        let relative = path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !relative {
            return Err(Error::invalid(
                name,
                "job name must be a relative path without `..` or `.` components",
            ));
        }
        if self.entrypoint.is_empty() {
            return Err(Error::invalid(name, "entrypoint is empty"));
        }
        if let Some(concurrent) = self.n_concurrent_jobs {
            if !self.is_job_array() {
                return Err(Error::invalid(
                    name,
                    "n_concurrent_jobs can only be used with a list of python_args",
                ));
            }
            if concurrent == 0 {
                return Err(Error::invalid(name, "n_concurrent_jobs must be positive"));
            }
        }
        if let PythonArgs::Array(lines) = &self.python_args {
            if lines.is_empty() {
                return Err(Error::invalid(name, "python_args list is empty"));
            }
        }
        if self.max_runtime_minutes == Some(0) {
            return Err(Error::invalid(
                name,
                "max_runtime_minutes must be a positive number of minutes",
            ));
        }
        if self.python_binary.is_none() && self.python_args != PythonArgs::None {
            warn!(
                "{}: python binary not set but passing python_args, arguments go to bash",
                name
            );
        }
        Ok(())
    }

    pub fn src_dir(&self) -> PathBuf {
        PathBuf::from(self.src_dir.as_deref().unwrap_or("./"))
    }

    /// Check that the source directory, the entrypoint and shipped libraries exist
    pub fn check_paths(&self) -> Result<()> {
        let src_dir = self.src_dir();
        if !src_dir.exists() {
            return Err(Error::MissingSourceDir(src_dir));
        }
        let entrypoint = src_dir.join(&self.entrypoint);
        if !entrypoint.exists() {
            return Err(Error::MissingEntrypoint(entrypoint));
        }
        for library in self.python_libraries.iter().flatten() {
            if !Path::new(library).is_dir() {
                return Err(Error::MissingLibrary(PathBuf::from(library)));
            }
        }
        Ok(())
    }

    /// Name of the source folder once copied into the job folder
    ///
    /// The path is canonicalised first so that `./` resolves to the name of the current directory.
    pub fn src_dir_name(&self) -> io::Result<String> {
        let resolved = fs::canonicalize(self.src_dir())?;
        resolved
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no folder name", resolved.display()),
                )
            })
    }

    /// Argument string of a single job, empty for a job array
    pub fn argument_string(&self) -> String {
        match &self.python_args {
            PythonArgs::None | PythonArgs::Array(_) => String::new(),
            PythonArgs::Literal(args) => args.clone(),
            PythonArgs::Flags(flags) => flatten_flags(flags),
        }
    }

    /// One rendered argument line per array task
    pub fn argument_lines(&self) -> Option<Vec<String>> {
        match &self.python_args {
            PythonArgs::Array(lines) => Some(lines.iter().map(ArgLine::render).collect()),
            _ => None,
        }
    }

    /// Basenames of the shipped libraries, as they appear inside the job folder
    pub fn library_names(&self) -> Vec<String> {
        self.python_libraries
            .iter()
            .flatten()
            .filter_map(|library| {
                Path::new(library)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect()
    }
}
