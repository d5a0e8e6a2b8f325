//! Create, submit and follow jobs
//!
//! A [`JobManager`] owns the configuration and one connection per reachable cluster. Jobs are
//! staged in a local folder, uploaded as a whole, then handed to sbatch. Everything needed later
//! (cluster, descriptor, slurm job id) is read back from the local job folder.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, SshEngine};
use crate::error::{Error, Result};
use crate::job::descriptor::JobDescriptor;
use crate::job::metadata::{self, JobMetadata};
use crate::job::path::{JobPaths, LogStream};
use crate::job::state::JobStatus;
use crate::remote::credentials::CredentialProvider;
use crate::remote::session::LibrarySession;
use crate::remote::subprocess::SubprocessSession;
use crate::remote::{CommandResult, RemoteError, RemoteExecution};
use crate::slurm::sacct::{self, SacctRow};
use crate::slurm::{sbatch, script};

/// Attempts on connection failures while calling sbatch
pub const SUBMIT_RETRIES: u32 = 3;
const HOME_PROBE: &str = "echo $HOME";
const ROOT_VAR: &str = "SLURMFERRY_PATH";
const JOB_PATH_VAR: &str = "SLURMFERRY_JOBPATH";

/// What is known about one job after an accounting query
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub name: String,
    pub cluster: String,
    /// Local creation date
    pub date: String,
    pub jobid: Option<u64>,
    pub status: JobStatus,
    /// Longest elapsed time among the rows of the job
    pub elapsed_secs: Option<u64>,
    pub start: Option<String>,
    pub nodelist: Option<String>,
    /// Rows of the individual array tasks, ordered by task index
    pub tasks: Vec<SacctRow>,
}

impl JobInfo {
    fn new(metadata: &JobMetadata, jobid: Option<u64>) -> JobInfo {
        JobInfo {
            name: metadata.name().to_string(),
            cluster: metadata.cluster.clone(),
            date: metadata.date.clone(),
            jobid,
            status: JobStatus::Unknown,
            elapsed_secs: None,
            start: None,
            nodelist: None,
            tasks: Vec::new(),
        }
    }

    fn apply(&mut self, rows: &[SacctRow]) {
        self.status = sacct::summarize(rows);
        self.elapsed_secs = rows.iter().filter_map(|row| row.elapsed_secs).max();
        // sacct prints ISO dates, the earliest sorts first
        self.start = rows.iter().filter_map(|row| row.start.clone()).min();
        self.nodelist = rows.iter().find_map(|row| row.nodelist.clone());
        let mut tasks: Vec<SacctRow> = rows.iter().filter(|row| row.task.is_some()).cloned().collect();
        tasks.sort_by_key(|row| row.task);
        self.tasks = tasks;
    }
}

/// Content of the most recent log files of a job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobLogs {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Local copy of the log folder, holds every task log of an array
    pub log_dir: PathBuf,
}

pub struct JobManager {
    config: Config,
    connections: BTreeMap<String, Box<dyn RemoteExecution>>,
    /// Remote home of every connected cluster
    home_dirs: BTreeMap<String, String>,
    /// Clusters that lost their connection or refused authentication during this session
    unusable: RefCell<BTreeSet<String>>,
}

impl JobManager {
    /// Open a connection to each cluster, clusters that can't be reached are left out with a warning
    pub fn connect(
        config: Config,
        clusters: &[String],
        credentials: Arc<dyn CredentialProvider>,
    ) -> JobManager {
        let mut connections: BTreeMap<String, Box<dyn RemoteExecution>> = BTreeMap::new();
        for cluster in clusters {
            let Some(settings) = config.cluster(cluster) else {
                warn!("Cluster {cluster} is not configured, it will be ignored");
                continue;
            };
            let connection: std::result::Result<Box<dyn RemoteExecution>, RemoteError> =
                match config.ssh_engine {
                    SshEngine::Subprocess => Ok(Box::new(SubprocessSession::new(
                        &settings.host,
                        settings.user.as_deref(),
                    ))),
                    SshEngine::Library => LibrarySession::connect(
                        &settings.host,
                        settings.user.as_deref(),
                        Arc::clone(&credentials),
                    )
                    .map(|session| Box::new(session) as Box<dyn RemoteExecution>),
                };
            match connection {
                Ok(connection) => {
                    connections.insert(cluster.clone(), connection);
                }
                Err(err) => warn!("Could not connect to cluster {cluster}, it will be ignored: {err}"),
            }
        }
        JobManager::with_connections(config, connections)
    }

    /// Use existing connections, each one is probed for its remote home directory
    pub fn with_connections(
        config: Config,
        connections: BTreeMap<String, Box<dyn RemoteExecution>>,
    ) -> JobManager {
        let mut reachable = BTreeMap::new();
        let mut home_dirs = BTreeMap::new();
        for (cluster, connection) in connections {
            match probe_home(connection.as_ref()) {
                Ok(home) => {
                    debug!("Home of {cluster} is {home}");
                    home_dirs.insert(cluster.clone(), home);
                    reachable.insert(cluster, connection);
                }
                Err(err) => warn!("Could not connect to cluster {cluster}, it will be ignored: {err}"),
            }
        }
        JobManager {
            config,
            connections: reachable,
            home_dirs,
            unusable: RefCell::new(BTreeSet::new()),
        }
    }

    /// No cluster at all, only local operations succeed
    pub fn offline(config: Config) -> JobManager {
        JobManager {
            config,
            connections: BTreeMap::new(),
            home_dirs: BTreeMap::new(),
            unusable: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Clusters that answered when the manager was created and have not failed since
    pub fn connected_clusters(&self) -> Vec<&str> {
        let unusable = self.unusable.borrow();
        self.connections
            .keys()
            .filter(|cluster| !unusable.contains(*cluster))
            .map(String::as_str)
            .collect()
    }

    fn connection(&self, cluster: &str) -> Result<&dyn RemoteExecution> {
        if self.unusable.borrow().contains(cluster) {
            return Err(Error::ClusterUnavailable(cluster.to_string()));
        }
        self.connections
            .get(cluster)
            .map(|connection| connection.as_ref())
            .ok_or_else(|| Error::ClusterUnavailable(cluster.to_string()))
    }

    /// Wrap a remote failure, a connection class failure retires the cluster for this session
    fn remote_error(&self, cluster: &str, err: RemoteError) -> Error {
        if err.is_connection() {
            warn!("Cluster {cluster} is not usable anymore in this session: {err}");
            self.unusable.borrow_mut().insert(cluster.to_string());
        }
        Error::remote(cluster, err)
    }

    /// Remote root of a cluster: the override, else the configured root, else `<home>/slurmferry`
    fn remote_root(&self, cluster: &str, remote_dir: Option<&str>) -> Result<PathBuf> {
        let home = self.home_dirs.get(cluster);
        let root = match remote_dir
            .map(str::to_string)
            .or_else(|| self.config.remote_root(cluster))
        {
            Some(root) => root,
            None => Config::remote_root_in_home(
                home.ok_or_else(|| Error::ClusterUnavailable(cluster.to_string()))?,
            ),
        };
        // a quoted `~` is not expanded by the remote shell
        let root = match (root.strip_prefix('~'), home) {
            (Some(rest), Some(home)) if rest.is_empty() || rest.starts_with('/') => {
                format!("{}{}", home.trim_end_matches('/'), rest)
            }
            _ => root,
        };
        Ok(PathBuf::from(root))
    }

    fn local_paths(&self, name: &str) -> JobPaths {
        JobPaths::from_name(name, &self.config.local_path)
    }

    fn metadata(&self, name: &str) -> Result<JobMetadata> {
        JobMetadata::read(&self.local_paths(name).metadata_path()).map_err(|source| {
            Error::Metadata {
                job: name.to_string(),
                source,
            }
        })
    }

    fn remote_paths(&self, metadata: &JobMetadata) -> Result<JobPaths> {
        let root = self.remote_root(
            &metadata.cluster,
            metadata.job_creation_info.remote_dir.as_deref(),
        )?;
        Ok(JobPaths::from_name(metadata.name(), root))
    }

    /// Run a command that must succeed
    fn run_checked(&self, cluster: &str, command: &str) -> Result<CommandResult> {
        let result = self
            .connection(cluster)?
            .run(command, false, None, 0)
            .map_err(|err| self.remote_error(cluster, err))?;
        if result.failed {
            return Err(Error::RemoteCommand {
                cluster: cluster.to_string(),
                command: command.to_string(),
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    /// Stage, upload and submit a job
    ///
    /// Returns the slurm job id, or `None` for a dry run which stops once the job folder is
    /// uploaded. All checks on the descriptor happen before any file is written.
    pub fn schedule(&self, descriptor: &JobDescriptor, dry_run: bool) -> Result<Option<u64>> {
        let name = descriptor.name.as_str();
        descriptor.validate()?;
        descriptor.check_paths()?;
        let cluster = descriptor
            .cluster
            .clone()
            .ok_or_else(|| Error::invalid(name, "no cluster given"))?;

        let src_dir_name = descriptor.src_dir_name()?;
        let local = JobPaths::resolve(
            name,
            self.config.local_root()?,
            Some(&src_dir_name),
            Some(&descriptor.entrypoint),
        );
        if local.job_root().exists() {
            return Err(Error::DuplicateJob(name.to_string()));
        }
        let connection = self.connection(&cluster)?;
        let remote_root = self.remote_root(&cluster, descriptor.remote_dir.as_deref())?;
        let remote = JobPaths::resolve(
            name,
            &remote_root,
            Some(&src_dir_name),
            Some(&descriptor.entrypoint),
        );

        info!("Preparing job {name} in {}", local.job_root().display());
        self.stage(descriptor, &cluster, &local, &remote)?;

        let remote_job_root = remote.job_root();
        let remote_parent = remote_job_root.parent().unwrap_or(&remote_root);
        info!("Sending job {name} to {cluster}:{}", remote_job_root.display());
        connection
            .upload_folder(&local.job_root(), remote_parent)
            .map_err(|err| self.remote_error(&cluster, err))?;

        if dry_run {
            info!("Dry run, job {name} was uploaded but not submitted");
            return Ok(None);
        }

        let mut env = BTreeMap::new();
        env.insert(ROOT_VAR.to_string(), remote_root.display().to_string());
        env.insert(JOB_PATH_VAR.to_string(), remote_job_root.display().to_string());
        let export = sbatch::export_argument(name, descriptor.env.as_ref());
        let command = sbatch::submit_command(
            &remote_job_root,
            descriptor.sbatch_arguments.as_deref(),
            &export,
        );
        let result = connection
            .run(&command, false, Some(&env), SUBMIT_RETRIES)
            .map_err(|err| self.remote_error(&cluster, err))?;
        if result.failed || !result.stderr.trim().is_empty() {
            return Err(Error::Submission {
                job: name.to_string(),
                cluster,
                stderr: result.stderr,
            });
        }

        let jobid = sbatch::parse_submission(&result.stdout).ok_or_else(|| {
            Error::UnparsableSubmission {
                job: name.to_string(),
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
            }
        })?;
        metadata::write_job_id(&local.jobid_path(), jobid)?;
        info!("Job {name} submitted to {cluster} with id {jobid}");
        Ok(Some(jobid))
    }

    /// Write the local job folder: sources, libraries, arguments, script and metadata
    fn stage(
        &self,
        descriptor: &JobDescriptor,
        cluster: &str,
        local: &JobPaths,
        remote: &JobPaths,
    ) -> Result<()> {
        let job_root = local.job_root();
        fs::create_dir_all(&job_root)?;

        let excluded = fs::canonicalize(local.root())?;
        copy_tree(&descriptor.src_dir(), &local.src_path(), &excluded)?;
        for library in descriptor.python_libraries.iter().flatten() {
            let library = Path::new(library);
            if let Some(library_name) = library.file_name() {
                info!("Shipping library {}", library.display());
                copy_tree(library, &job_root.join(library_name), &excluded)?;
            }
        }

        script::write_args_file(descriptor, &job_root)?;
        let script = script::render_for_cluster(
            descriptor,
            &local.entrypoint_path_from_cwd(),
            &remote.job_root(),
            self.config.cluster(cluster),
        )?;
        fs::write(local.script_path(), script)?;

        JobMetadata::new(descriptor, cluster).write(&local.metadata_path())?;
        Ok(())
    }

    /// Full records of the given jobs, one accounting query per cluster
    ///
    /// Jobs of a cluster that is not connected or fails to answer keep the `Unknown` status.
    pub fn job_infos(&self, names: &[&str]) -> Result<Vec<JobInfo>> {
        let mut infos = Vec::with_capacity(names.len());
        let mut by_cluster: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for name in names {
            let metadata = self.metadata(name)?;
            let jobid = metadata::read_job_id(&self.local_paths(name).jobid_path())?;
            if jobid.is_some() {
                by_cluster
                    .entry(metadata.cluster.clone())
                    .or_default()
                    .push(infos.len());
            }
            infos.push(JobInfo::new(&metadata, jobid));
        }

        for (cluster, indices) in by_cluster {
            let Ok(connection) = self.connection(&cluster) else {
                warn!("Cluster {cluster} is not connected, status of its jobs is unknown");
                continue;
            };
            let mut ids: Vec<u64> = indices.iter().filter_map(|&i| infos[i].jobid).collect();
            ids.sort_unstable();
            ids.dedup();

            let command = sbatch::sacct_command(&ids);
            let result = match connection.run(&command, false, None, 0) {
                Ok(result) => result,
                Err(err) => {
                    let err = self.remote_error(&cluster, err);
                    warn!("Could not query {cluster}, status of its jobs is unknown: {err}");
                    continue;
                }
            };
            if result.failed {
                warn!("sacct failed on {cluster}: {}", result.stderr.trim());
                continue;
            }

            let jobs = sacct::by_job(sacct::parse_table(&result.stdout));
            for i in indices {
                let rows = infos[i].jobid.and_then(|jobid| jobs.get(&jobid));
                match rows {
                    Some(rows) => infos[i].apply(rows),
                    None => debug!("No accounting record yet for {}", infos[i].name),
                }
            }
        }
        Ok(infos)
    }

    /// Status of each job, in the order of `names`
    pub fn status(&self, names: &[&str]) -> Result<Vec<JobStatus>> {
        Ok(self
            .job_infos(names)?
            .into_iter()
            .map(|info| info.status)
            .collect())
    }

    /// Cancel a submitted job
    pub fn stop(&self, name: &str) -> Result<()> {
        let metadata = self.metadata(name)?;
        let jobid = metadata::read_job_id(&self.local_paths(name).jobid_path())?
            .ok_or_else(|| Error::NotSubmitted(name.to_string()))?;
        info!("Cancelling job {name} ({jobid}) on {}", metadata.cluster);
        self.run_checked(&metadata.cluster, &sbatch::cancel_command(jobid))?;
        Ok(())
    }

    /// Poll until the job reaches a final state or `max_seconds` elapsed
    ///
    /// The last observed status is returned, it is not final if the time ran out.
    pub fn wait_until_done(&self, name: &str, max_seconds: u64) -> Result<JobStatus> {
        let started = Instant::now();
        let limit = Duration::from_secs(max_seconds);
        loop {
            let status = self
                .status(&[name])?
                .into_iter()
                .next()
                .unwrap_or(JobStatus::Unknown);
            if status.is_terminal() {
                info!("Job {name} finished with status {status}");
                return Ok(status);
            }
            if started.elapsed() >= limit {
                info!("Stopped waiting for job {name} after {max_seconds}s, status is {status}");
                return Ok(status);
            }
            debug!("Job {name} is {status}, waiting");
            thread::sleep(self.config.poll_interval);
        }
    }

    /// Download the log folder and return the most recent stdout and stderr
    ///
    /// A job without remote logs yet is not an error, both logs are then `None`.
    pub fn fetch_logs(&self, name: &str) -> Result<JobLogs> {
        let metadata = self.metadata(name)?;
        let local = self.local_paths(name);
        let remote = self.remote_paths(&metadata)?;
        let connection = self.connection(&metadata.cluster)?;

        match connection.download_folder(&remote.log_dir(), &local.log_dir()) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                warn!("No logs found for job {name} at {}", remote.log_dir().display());
            }
            Err(err) => return Err(self.remote_error(&metadata.cluster, err)),
        }

        let read = |stream: LogStream| -> Result<Option<String>> {
            match local.latest_log(stream)? {
                Some(path) => Ok(Some(fs::read_to_string(path)?)),
                None => Ok(None),
            }
        };
        Ok(JobLogs {
            stdout: read(LogStream::Stdout)?,
            stderr: read(LogStream::Stderr)?,
            log_dir: local.log_dir(),
        })
    }

    /// Merge the remote job folder into the local one
    ///
    /// Returns the local job folder, `None` if the job folder is missing on the cluster.
    pub fn download_job(&self, name: &str) -> Result<Option<PathBuf>> {
        let metadata = self.metadata(name)?;
        let local = self.local_paths(name);
        let remote = self.remote_paths(&metadata)?;
        let connection = self.connection(&metadata.cluster)?;

        info!("Downloading job {name} into {}", local.job_root().display());
        match connection.download_folder(&remote.job_root(), &local.job_root()) {
            Ok(()) => Ok(Some(local.job_root())),
            Err(err) if err.is_not_found() => {
                warn!("Job folder of {name} not found at {}", remote.job_root().display());
                Ok(None)
            }
            Err(err) => Err(self.remote_error(&metadata.cluster, err)),
        }
    }

    /// Most recent jobs first
    pub fn list_jobs(&self, n: usize) -> Result<Vec<JobMetadata>> {
        let jobs_dir = self.local_paths("").jobs_dir();
        Ok(metadata::list_metadatas(&jobs_dir, Some(n))?)
    }

    /// Name of the most recently created job
    pub fn latest_job(&self) -> Result<String> {
        let jobs_dir = self.local_paths("").jobs_dir();
        metadata::list_metadatas(&jobs_dir, Some(1))?
            .into_iter()
            .next()
            .map(|metadata| metadata.name().to_string())
            .ok_or(Error::EmptyStore(jobs_dir))
    }
}

fn probe_home(connection: &dyn RemoteExecution) -> std::result::Result<String, RemoteError> {
    let result = connection.run(HOME_PROBE, false, None, 0)?.check()?;
    let home = result.stdout.trim();
    if home.is_empty() {
        return Err(RemoteError::Command {
            command: HOME_PROBE.to_string(),
            code: result.return_code,
            stderr: "empty home directory".to_string(),
        });
    }
    Ok(home.to_string())
}

/// Copy a directory tree, leaving out `excluded` if it lies inside
fn copy_tree(from: &Path, to: &Path, excluded: &Path) -> Result<()> {
    let from = fs::canonicalize(from)?;
    let walker = WalkDir::new(&from)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| !entry.path().starts_with(excluded));
    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(&from)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    debug!("Copied {} to {}", from.display(), to.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slurm::sacct::parse_table;

    #[test]
    fn array_info_collects_tasks() {
        let metadata = JobMetadata {
            job_creation_info: JobDescriptor::new("sweep", "main.py"),
            cluster: "hpc".to_string(),
            ..Default::default()
        };
        let rows = parse_table(
            "JobID|Elapsed|Start|State|NodeList|
7_1|00:00:20|2024-03-01T10:02:00|COMPLETED|n2|
7_0|00:01:00|2024-03-01T10:00:00|COMPLETED|n1|
",
        );
        let mut info = JobInfo::new(&metadata, Some(7));
        info.apply(&rows);
        assert_eq!(info.status, JobStatus::Completed);
        assert_eq!(info.elapsed_secs, Some(60));
        assert_eq!(info.start.as_deref(), Some("2024-03-01T10:00:00"));
        let tasks: Vec<Option<u32>> = info.tasks.iter().map(|row| row.task).collect();
        assert_eq!(tasks, vec![Some(0), Some(1)]);
    }

    #[test]
    fn copy_skips_excluded_folder() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("pkg")).unwrap();
        fs::create_dir_all(src.join("store")).unwrap();
        fs::write(src.join("main.py"), "print(1)").unwrap();
        fs::write(src.join("pkg").join("mod.py"), "").unwrap();
        fs::write(src.join("store").join("big"), "").unwrap();

        let dest = dir.path().join("dest");
        let excluded = fs::canonicalize(src.join("store")).unwrap();
        copy_tree(&src, &dest, &excluded).unwrap();
        assert!(dest.join("main.py").is_file());
        assert!(dest.join("pkg").join("mod.py").is_file());
        assert!(!dest.join("store").exists());
    }
}
