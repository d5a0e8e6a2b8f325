use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use tempfile::TempDir;
use walkdir::WalkDir;

use slurmferry::{
    ClusterConfig, CommandResult, Config, Error, JobDescriptor, JobManager, JobStatus, PythonArgs,
    RemoteError, RemoteExecution,
};

/// How the fake cluster answers accounting queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SacctMode {
    Answer,
    /// The connection drops while sacct runs
    ConnectionLost,
    /// sacct itself exits non zero
    Fails,
}

/// In-memory cluster: remote paths live below a local folder, commands are answered from a script
struct FakeCluster {
    host: String,
    fs_root: PathBuf,
    reachable: bool,
    sacct: Rc<RefCell<String>>,
    sacct_mode: Rc<Cell<SacctMode>>,
    commands: Rc<RefCell<Vec<String>>>,
}

impl FakeCluster {
    fn local(&self, remote: &Path) -> PathBuf {
        self.fs_root.join(remote.strip_prefix("/").unwrap_or(remote))
    }

    fn unreachable(&self) -> RemoteError {
        RemoteError::RetriesExhausted {
            command: "ssh".to_string(),
            attempts: 1,
            message: format!("{} is down", self.host),
        }
    }
}

fn copy_into(from: &Path, to: &Path) {
    for entry in WalkDir::new(from) {
        let entry = entry.unwrap();
        let target = to.join(entry.path().strip_prefix(from).unwrap());
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).unwrap();
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}

impl RemoteExecution for FakeCluster {
    fn run(
        &self,
        command: &str,
        _pty: bool,
        env: Option<&BTreeMap<String, String>>,
        _retries: u32,
    ) -> Result<CommandResult, RemoteError> {
        if !self.reachable {
            return Err(self.unreachable());
        }
        let mut recorded = command.to_string();
        if let Some(env) = env {
            recorded = format!("{env:?} {recorded}");
        }
        self.commands.borrow_mut().push(recorded);

        let ok = |stdout: &str| Ok(CommandResult::new(command, 0, stdout.to_string(), String::new()));
        if command == "echo $HOME" {
            ok("/home/me\n")
        } else if command.contains("sbatch") {
            ok("Submitted batch job 4242\n")
        } else if command.starts_with("sacct") {
            match self.sacct_mode.get() {
                SacctMode::Answer => ok(self.sacct.borrow().as_str()),
                SacctMode::ConnectionLost => Err(RemoteError::Connection {
                    host: self.host.clone(),
                    message: "Connection reset by peer".to_string(),
                }),
                SacctMode::Fails => Ok(CommandResult::new(
                    command,
                    1,
                    String::new(),
                    "sacct: error: Problem talking to the database".to_string(),
                )),
            }
        } else {
            ok("")
        }
    }

    fn upload_file(&self, local: &Path, remote: &Path) -> Result<(), RemoteError> {
        let target = self.local(remote);
        fs::create_dir_all(target.parent().unwrap())?;
        fs::copy(local, target)?;
        Ok(())
    }

    fn upload_folder(&self, local: &Path, remote_parent: &Path) -> Result<(), RemoteError> {
        self.commands
            .borrow_mut()
            .push(format!("upload {}", remote_parent.display()));
        let target = self.local(remote_parent).join(local.file_name().unwrap());
        copy_into(local, &target);
        Ok(())
    }

    fn download_file(&self, remote: &Path, local: &Path) -> Result<(), RemoteError> {
        let source = self.local(remote);
        if !source.exists() {
            return Err(RemoteError::NotFound(remote.to_path_buf()));
        }
        fs::copy(source, local)?;
        Ok(())
    }

    fn download_folder(&self, remote: &Path, local: &Path) -> Result<(), RemoteError> {
        let source = self.local(remote);
        if !source.exists() {
            return Err(RemoteError::NotFound(remote.to_path_buf()));
        }
        copy_into(&source, local);
        Ok(())
    }
}

struct Handle {
    fs_root: PathBuf,
    sacct: Rc<RefCell<String>>,
    sacct_mode: Rc<Cell<SacctMode>>,
    commands: Rc<RefCell<Vec<String>>>,
}

impl Handle {
    fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    fn remote(&self, remote: &str) -> PathBuf {
        self.fs_root.join(remote.trim_start_matches('/'))
    }
}

fn fake_cluster(scratch: &Path, host: &str, reachable: bool) -> (Box<dyn RemoteExecution>, Handle) {
    let fs_root = scratch.join(format!("remote-{host}"));
    fs::create_dir_all(&fs_root).unwrap();
    let sacct = Rc::new(RefCell::new(String::new()));
    let sacct_mode = Rc::new(Cell::new(SacctMode::Answer));
    let commands = Rc::new(RefCell::new(Vec::new()));
    let cluster = FakeCluster {
        host: host.to_string(),
        fs_root: fs_root.clone(),
        reachable,
        sacct: Rc::clone(&sacct),
        sacct_mode: Rc::clone(&sacct_mode),
        commands: Rc::clone(&commands),
    };
    (
        Box::new(cluster),
        Handle {
            fs_root,
            sacct,
            sacct_mode,
            commands,
        },
    )
}

/// Scratch folder holding a source tree, a local root and the fake remotes
struct Setup {
    dir: TempDir,
    config: Config,
}

fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("project");
    fs::create_dir_all(src.join("pkg")).unwrap();
    fs::write(src.join("main.py"), "print('hello')\n").unwrap();
    fs::write(src.join("pkg").join("util.py"), "").unwrap();

    let mut config = Config {
        local_path: dir.path().join("local"),
        poll_interval: Duration::from_millis(1),
        ..Default::default()
    };
    for name in ["alpha", "beta"] {
        config.clusters.insert(
            name.to_string(),
            ClusterConfig {
                host: format!("{name}.example.org"),
                default_partition: Some("batch".to_string()),
                ..Default::default()
            },
        );
    }
    Setup { dir, config }
}

impl Setup {
    fn descriptor(&self, name: &str, cluster: &str) -> JobDescriptor {
        let mut descriptor = JobDescriptor::new(name, "main.py");
        descriptor.cluster = Some(cluster.to_string());
        descriptor.src_dir = Some(self.dir.path().join("project").display().to_string());
        descriptor.python_binary = Some("python3".to_string());
        descriptor
    }

    fn manager(&self, clusters: Vec<(&str, Box<dyn RemoteExecution>)>) -> JobManager {
        let connections = clusters
            .into_iter()
            .map(|(name, connection)| (name.to_string(), connection))
            .collect();
        JobManager::with_connections(self.config.clone(), connections)
    }
}

#[test]
fn schedule_stages_uploads_and_submits() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);

    let mut descriptor = setup.descriptor("exp/run-1", "alpha");
    let mut env = BTreeMap::new();
    env.insert("SEED".to_string(), "7".to_string());
    descriptor.env = Some(env);

    let jobid = manager.schedule(&descriptor, false).unwrap();
    assert_eq!(jobid, Some(4242));

    let local_job = setup.config.local_path.join("jobs").join("exp").join("run-1");
    assert!(local_job.join("metadata.json").is_file());
    assert!(local_job.join("project").join("main.py").is_file());
    assert!(local_job.join("project").join("pkg").join("util.py").is_file());
    assert_eq!(
        fs::read_to_string(local_job.join("jobid.json")).unwrap(),
        r#"{"jobid":4242}"#
    );

    let script = fs::read_to_string(local_job.join("slurm_script.sh")).unwrap();
    assert!(script.contains("#SBATCH --job-name=exp/run-1\n"));
    assert!(script.contains("#SBATCH --partition=batch\n"));
    assert!(script.contains("export PYTHONPATH=$PYTHONPATH:/home/me/slurmferry/jobs/exp/run-1\n"));
    assert!(script.ends_with("python3 project/main.py\n"));

    let uploaded = remote.remote("/home/me/slurmferry/jobs/exp/run-1/slurm_script.sh");
    assert_eq!(fs::read_to_string(uploaded).unwrap(), script);

    let commands = remote.commands();
    assert_eq!(commands[0], "echo $HOME");
    assert_eq!(commands[1], "upload /home/me/slurmferry/jobs/exp");
    assert!(commands[2].contains("\"SLURMFERRY_JOBPATH\": \"/home/me/slurmferry/jobs/exp/run-1\""));
    assert!(commands[2].ends_with(
        "cd /home/me/slurmferry/jobs/exp/run-1; mkdir -p logs/; sbatch --export=ALL,SLURMFERRY_JOBNAME=exp/run-1,SEED=7 slurm_script.sh"
    ));

    let metadata = fs::read_to_string(local_job.join("metadata.json")).unwrap();
    let metadata: serde_json::Value = serde_json::from_str(&metadata).unwrap();
    assert_eq!(metadata["cluster"], "alpha");
    assert_eq!(metadata["job_creation_info"]["jobname"], "exp/run-1");
    assert_eq!(metadata["job_creation_info"]["partition"], serde_json::Value::Null);
}

#[test]
fn dry_run_uploads_without_submitting() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);

    let jobid = manager.schedule(&setup.descriptor("dry", "alpha"), true).unwrap();
    assert_eq!(jobid, None);
    assert!(remote.remote("/home/me/slurmferry/jobs/dry/slurm_script.sh").is_file());
    assert!(!remote.commands().iter().any(|c| c.contains("sbatch")));
    assert!(!setup.config.local_path.join("jobs/dry/jobid.json").exists());
}

#[test]
fn duplicate_name_is_rejected_before_remote_work() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);
    let descriptor = setup.descriptor("twice", "alpha");

    manager.schedule(&descriptor, false).unwrap();
    let before = remote.commands().len();

    let err = manager.schedule(&descriptor, false).unwrap_err();
    assert!(matches!(err, Error::DuplicateJob(ref name) if name == "twice"));
    assert!(err.is_validation());
    assert_eq!(remote.commands().len(), before);
}

#[test]
fn concurrency_without_array_fails_before_io() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);

    let mut descriptor = setup.descriptor("bad", "alpha");
    descriptor.n_concurrent_jobs = Some(2);
    let err = manager.schedule(&descriptor, false).unwrap_err();
    assert!(matches!(err, Error::InvalidDescriptor { .. }));
    assert!(!setup.config.local_path.join("jobs").join("bad").exists());
    assert_eq!(remote.commands(), vec!["echo $HOME".to_string()]);
}

#[test]
fn missing_entrypoint_is_reported() {
    let setup = setup();
    let (alpha, _remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);

    let mut descriptor = setup.descriptor("nope", "alpha");
    descriptor.entrypoint = "missing.py".to_string();
    assert!(matches!(
        manager.schedule(&descriptor, false),
        Err(Error::MissingEntrypoint(_))
    ));
}

#[test]
fn job_array_ships_argument_file() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);

    let mut descriptor = setup.descriptor("sweep", "alpha");
    let lines: Vec<serde_json::Value> = (0..3).map(|i| serde_json::json!({"seed": i})).collect();
    descriptor.python_args = serde_json::from_value::<PythonArgs>(serde_json::Value::Array(lines)).unwrap();
    descriptor.n_concurrent_jobs = Some(2);

    manager.schedule(&descriptor, false).unwrap();
    let args = fs::read_to_string(remote.remote("/home/me/slurmferry/jobs/sweep/python-args.txt")).unwrap();
    assert_eq!(args, "--seed=0\n--seed=1\n--seed=2\n");
    let script = fs::read_to_string(remote.remote("/home/me/slurmferry/jobs/sweep/slurm_script.sh")).unwrap();
    assert!(script.contains("#SBATCH --array=0-2%2\n"));
}

#[test]
fn status_degrades_only_the_unreachable_cluster() {
    let setup = setup();
    let (alpha, _) = fake_cluster(setup.dir.path(), "alpha", true);
    let (beta, _) = fake_cluster(setup.dir.path(), "beta", true);
    let manager = setup.manager(vec![("alpha", alpha), ("beta", beta)]);
    manager.schedule(&setup.descriptor("on-alpha", "alpha"), false).unwrap();
    manager.schedule(&setup.descriptor("on-beta", "beta"), false).unwrap();

    // later session: beta is down
    let (alpha, alpha_remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let (beta, _) = fake_cluster(setup.dir.path(), "beta", false);
    *alpha_remote.sacct.borrow_mut() =
        "JobID|Elapsed|Start|State|NodeList|\n4242|00:10:00|2024-03-01T10:00:00|RUNNING|node7|\n".to_string();
    let manager = setup.manager(vec![("alpha", alpha), ("beta", beta)]);
    assert_eq!(manager.connected_clusters(), vec!["alpha"]);

    let statuses = manager.status(&["on-alpha", "on-beta"]).unwrap();
    assert_eq!(statuses, vec![JobStatus::Running, JobStatus::Unknown]);

    let infos = manager.job_infos(&["on-alpha"]).unwrap();
    assert_eq!(infos[0].elapsed_secs, Some(600));
    assert_eq!(infos[0].nodelist.as_deref(), Some("node7"));
}

const RUNNING_4242: &str =
    "JobID|Elapsed|Start|State|NodeList|\n4242|00:10:00|2024-03-01T10:00:00|RUNNING|node7|\n";

#[test]
fn connection_lost_during_query_degrades_only_that_cluster() {
    let setup = setup();
    let (alpha, alpha_remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let (beta, beta_remote) = fake_cluster(setup.dir.path(), "beta", true);
    let manager = setup.manager(vec![("alpha", alpha), ("beta", beta)]);
    manager.schedule(&setup.descriptor("on-alpha", "alpha"), false).unwrap();
    manager.schedule(&setup.descriptor("on-beta", "beta"), false).unwrap();

    *alpha_remote.sacct.borrow_mut() = RUNNING_4242.to_string();
    *beta_remote.sacct.borrow_mut() = RUNNING_4242.to_string();
    beta_remote.sacct_mode.set(SacctMode::ConnectionLost);

    let statuses = manager.status(&["on-beta", "on-alpha"]).unwrap();
    assert_eq!(statuses, vec![JobStatus::Unknown, JobStatus::Running]);

    // beta is retired for the rest of the session
    assert_eq!(manager.connected_clusters(), vec!["alpha"]);
    assert!(matches!(
        manager.stop("on-beta"),
        Err(Error::ClusterUnavailable(ref cluster)) if cluster == "beta"
    ));
    beta_remote.sacct_mode.set(SacctMode::Answer);
    let before = beta_remote.commands().len();
    assert_eq!(
        manager.status(&["on-beta"]).unwrap(),
        vec![JobStatus::Unknown]
    );
    assert_eq!(beta_remote.commands().len(), before);
}

#[test]
fn failing_query_degrades_only_that_cluster() {
    let setup = setup();
    let (alpha, alpha_remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let (beta, beta_remote) = fake_cluster(setup.dir.path(), "beta", true);
    let manager = setup.manager(vec![("alpha", alpha), ("beta", beta)]);
    manager.schedule(&setup.descriptor("on-alpha", "alpha"), false).unwrap();
    manager.schedule(&setup.descriptor("on-beta", "beta"), false).unwrap();

    *alpha_remote.sacct.borrow_mut() = RUNNING_4242.to_string();
    beta_remote.sacct_mode.set(SacctMode::Fails);

    let statuses = manager.status(&["on-alpha", "on-beta"]).unwrap();
    assert_eq!(statuses, vec![JobStatus::Running, JobStatus::Unknown]);

    // a failing command leaves the connection usable
    assert_eq!(manager.connected_clusters(), vec!["alpha", "beta"]);
    manager.stop("on-beta").unwrap();
    assert_eq!(beta_remote.commands().last().map(String::as_str), Some("scancel 4242"));
}

#[test]
fn status_batches_one_query_per_cluster() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);
    manager.schedule(&setup.descriptor("a", "alpha"), false).unwrap();
    manager.schedule(&setup.descriptor("b", "alpha"), false).unwrap();
    *remote.sacct.borrow_mut() =
        "JobID|Elapsed|Start|State|NodeList|\n4242|00:00:05|2024-03-01T10:00:00|COMPLETED|n1|\n".to_string();

    let statuses = manager.status(&["a", "b"]).unwrap();
    assert_eq!(statuses, vec![JobStatus::Completed, JobStatus::Completed]);
    let queries: Vec<String> = remote
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("sacct"))
        .collect();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].ends_with("--jobs=4242"));
}

#[test]
fn stop_requires_a_job_id() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);

    manager.schedule(&setup.descriptor("staged", "alpha"), true).unwrap();
    assert!(matches!(manager.stop("staged"), Err(Error::NotSubmitted(_))));

    manager.schedule(&setup.descriptor("running", "alpha"), false).unwrap();
    manager.stop("running").unwrap();
    assert_eq!(remote.commands().last().map(String::as_str), Some("scancel 4242"));
}

#[test]
fn wait_returns_last_status_on_timeout() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);
    manager.schedule(&setup.descriptor("slow", "alpha"), false).unwrap();

    *remote.sacct.borrow_mut() =
        "JobID|Elapsed|Start|State|NodeList|\n4242|00:00:00|Unknown|PENDING|None assigned|\n".to_string();
    assert_eq!(manager.wait_until_done("slow", 0).unwrap(), JobStatus::Pending);

    *remote.sacct.borrow_mut() =
        "JobID|Elapsed|Start|State|NodeList|\n4242|00:01:00|2024-03-01T10:00:00|OUT_OF_MEMORY|n1|\n".to_string();
    assert_eq!(manager.wait_until_done("slow", 60).unwrap(), JobStatus::OutOfMemory);
}

#[test]
fn logs_are_fetched_when_present() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);
    manager.schedule(&setup.descriptor("logged", "alpha"), false).unwrap();

    let logs = manager.fetch_logs("logged").unwrap();
    assert_eq!(logs.stdout, None);
    assert_eq!(logs.stderr, None);

    let log_dir = remote.remote("/home/me/slurmferry/jobs/logged/logs");
    fs::create_dir_all(&log_dir).unwrap();
    fs::write(log_dir.join("stdout"), "hello\n").unwrap();
    fs::write(log_dir.join("stderr"), "").unwrap();

    let logs = manager.fetch_logs("logged").unwrap();
    assert_eq!(logs.stdout.as_deref(), Some("hello\n"));
    assert_eq!(logs.stderr.as_deref(), Some(""));
    assert!(logs.log_dir.join("stdout").is_file());
}

#[test]
fn download_keeps_local_job_id() {
    let setup = setup();
    let (alpha, remote) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);
    manager.schedule(&setup.descriptor("results", "alpha"), false).unwrap();
    fs::write(remote.remote("/home/me/slurmferry/jobs/results/out.csv"), "a,b\n").unwrap();

    let path = manager.download_job("results").unwrap().unwrap();
    assert!(path.join("out.csv").is_file());
    assert!(path.join("jobid.json").is_file());
}

#[test]
fn latest_job_and_listing() {
    let setup = setup();
    let manager = JobManager::offline(setup.config.clone());
    assert!(matches!(manager.latest_job(), Err(Error::EmptyStore(_))));

    let (alpha, _) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);
    manager.schedule(&setup.descriptor("first", "alpha"), false).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    manager.schedule(&setup.descriptor("group/second", "alpha"), false).unwrap();

    assert_eq!(manager.latest_job().unwrap(), "group/second");
    let names: Vec<String> = manager
        .list_jobs(10)
        .unwrap()
        .iter()
        .map(|metadata| metadata.name().to_string())
        .collect();
    assert_eq!(names, vec!["group/second", "first"]);
}

#[test]
fn unconnected_cluster_is_unavailable() {
    let setup = setup();
    let manager = JobManager::offline(setup.config.clone());
    assert!(matches!(
        manager.schedule(&setup.descriptor("lonely", "alpha"), false),
        Err(Error::ClusterUnavailable(_))
    ));
}

#[test]
fn corrupt_metadata_is_reported_for_the_job() {
    let setup = setup();
    let (alpha, _) = fake_cluster(setup.dir.path(), "alpha", true);
    let manager = setup.manager(vec![("alpha", alpha)]);
    manager.schedule(&setup.descriptor("garbled", "alpha"), false).unwrap();
    fs::write(
        setup.config.local_path.join("jobs/garbled/metadata.json"),
        "{ not json",
    )
    .unwrap();

    match manager.status(&["garbled"]) {
        Err(Error::Metadata { job, .. }) => assert_eq!(job, "garbled"),
        other => panic!("unexpected {other:?}"),
    }
}
