//! Submit and follow slurm jobs on remote clusters over ssh
//!
//! Jobs are described by a [`JobDescriptor`], staged in a local folder, uploaded to the cluster and
//! submitted with sbatch by a [`JobManager`]. The local folder keeps the metadata needed to query,
//! cancel or download the job later.

pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod remote;
pub mod request;
pub mod slurm;

pub use config::{ClusterConfig, Config, ConfigError, SshEngine};
pub use error::{Error, Result};
pub use job::descriptor::{ArgLine, JobDescriptor, PythonArgs};
pub use job::metadata::JobMetadata;
pub use job::path::JobPaths;
pub use job::state::JobStatus;
pub use manager::{JobInfo, JobLogs, JobManager};
pub use remote::{CommandResult, RemoteError, RemoteExecution};
