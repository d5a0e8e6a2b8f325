use std::path::PathBuf;

use thiserror::Error as ThisError;

use crate::remote::RemoteError;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while creating, submitting or querying a job
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid job description for {job}: {reason}")]
    InvalidDescriptor { job: String, reason: String },

    #[error("the src_dir path {0} is missing")]
    MissingSourceDir(PathBuf),

    #[error("the entrypoint could not be found at {0}")]
    MissingEntrypoint(PathBuf),

    #[error("python library {0} does not exist")]
    MissingLibrary(PathBuf),

    #[error("job name {0} has already been used, job names must be unique")]
    DuplicateJob(String),

    #[error("no configuration found for cluster {0}")]
    UnknownCluster(String),

    #[error("no connection available for cluster {0}")]
    ClusterUnavailable(String),

    #[error("job {0} has no recorded slurm job id, it was never submitted")]
    NotSubmitted(String),

    #[error("could not submit job {job} on {cluster}:\n{stderr}")]
    Submission {
        job: String,
        cluster: String,
        stderr: String,
    },

    #[error("job {job} submitted without error but sbatch output could not be parsed:\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    UnparsableSubmission {
        job: String,
        stdout: String,
        stderr: String,
    },

    #[error("command `{command}` failed on {cluster}: {stderr}")]
    RemoteCommand {
        cluster: String,
        command: String,
        stderr: String,
    },

    #[error("no job was found in {0}")]
    EmptyStore(PathBuf),

    #[error("could not read metadata of job {job}: {source}")]
    Metadata {
        job: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote operation on {cluster} failed: {source}")]
    Remote {
        cluster: String,
        #[source]
        source: RemoteError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("could not render slurm script: {0}")]
    Template(#[from] tinytemplate::error::Error),
}

impl Error {
    pub(crate) fn remote(cluster: &str, source: RemoteError) -> Self {
        Error::Remote {
            cluster: cluster.to_string(),
            source,
        }
    }

    pub(crate) fn invalid(job: &str, reason: impl Into<String>) -> Self {
        Error::InvalidDescriptor {
            job: job.to_string(),
            reason: reason.into(),
        }
    }

    /// Validation errors are raised before any remote I/O takes place
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidDescriptor { .. }
                | Error::MissingSourceDir(_)
                | Error::MissingEntrypoint(_)
                | Error::MissingLibrary(_)
                | Error::DuplicateJob(_)
        )
    }
}
