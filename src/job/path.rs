use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const METADATA_FILE: &str = "metadata.json";
pub const JOBID_FILE: &str = "jobid.json";
pub const SCRIPT_FILE: &str = "slurm_script.sh";
pub const ARGS_FILE: &str = "python-args.txt";
pub const LOG_DIR: &str = "logs";

/// Bookkeeping paths of a single job, valid both locally and on a cluster
///
/// Paths are computed from the root and the job name on every call and never stored. The job name
/// may contain `/`, in which case the job folder is nested, e.g. `sweep/lr-0.1` lives in
/// `<root>/jobs/sweep/lr-0.1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    root: PathBuf,
    name: String,
    src_dir_name: Option<String>,
    entrypoint: Option<String>,
}

/// Which of the two captured streams a log file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn suffix(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

impl JobPaths {
    pub fn resolve(
        name: &str,
        root: impl Into<PathBuf>,
        src_dir_name: Option<&str>,
        entrypoint: Option<&str>,
    ) -> JobPaths {
        JobPaths {
            root: root.into(),
            name: name.to_string(),
            src_dir_name: src_dir_name.map(str::to_string),
            entrypoint: entrypoint.map(str::to_string),
        }
    }

    /// Layout of an existing job where only the name is known
    pub fn from_name(name: &str, root: impl Into<PathBuf>) -> JobPaths {
        JobPaths::resolve(name, root, None, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    pub fn job_root(&self) -> PathBuf {
        self.jobs_dir().join(&self.name)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.job_root().join(METADATA_FILE)
    }

    pub fn jobid_path(&self) -> PathBuf {
        self.job_root().join(JOBID_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.job_root().join(LOG_DIR)
    }

    /// Fixed log path of a single (non array) job
    pub fn log_path(&self, stream: LogStream) -> PathBuf {
        self.log_dir().join(stream.suffix())
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.log_path(LogStream::Stdout)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.log_path(LogStream::Stderr)
    }

    /// Copy of the source directory inside the job folder, the job root if no source is known
    pub fn src_path(&self) -> PathBuf {
        match &self.src_dir_name {
            Some(dir) => self.job_root().join(dir),
            None => self.job_root(),
        }
    }

    pub fn script_path(&self) -> PathBuf {
        self.job_root().join(SCRIPT_FILE)
    }

    /// One line of arguments per array task
    pub fn args_path(&self) -> PathBuf {
        self.job_root().join(ARGS_FILE)
    }

    /// Entrypoint relative to the job root, which is the working directory of the slurm script
    pub fn entrypoint_path_from_cwd(&self) -> PathBuf {
        let src = PathBuf::from(self.src_dir_name.as_deref().unwrap_or_default());
        match &self.entrypoint {
            Some(entrypoint) => src.join(entrypoint),
            None => src,
        }
    }

    /// Log files of one stream found in the log directory, oldest first
    ///
    /// A single job writes `logs/stdout`, an array job writes `logs/<task>.stdout`. The number of
    /// tasks is only known when the script is rendered, so files are discovered rather than computed.
    pub fn log_files(&self, stream: LogStream) -> io::Result<Vec<PathBuf>> {
        let log_dir = self.log_dir();
        if !log_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&log_dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.ends_with(stream.suffix()))
                .unwrap_or(false);
            if matches && path.is_file() {
                let modified = fs::metadata(&path)?.modified()?;
                files.push((modified, path));
            }
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    /// Most recently modified log file of a stream
    pub fn latest_log(&self, stream: LogStream) -> io::Result<Option<PathBuf>> {
        Ok(self.log_files(stream)?.pop())
    }
}
