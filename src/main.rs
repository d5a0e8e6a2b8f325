use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;

use slurmferry::config::Config;
use slurmferry::job::metadata::JobMetadata;
use slurmferry::job::path::JobPaths;
use slurmferry::remote::credentials::EnvCredentials;
use slurmferry::request::message::Message;
use slurmferry::{JobInfo, JobManager};

#[derive(Parser, Debug)]
#[command(name = "slurmferry")]
#[command(version)]
#[command(about = "Ship jobs to slurm clusters over ssh and follow them")]
struct Args {
    /// Configuration file, defaults to $SLURMFERRY_CONFIG or the user config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stage, upload and submit the job described in a JSON file
    Submit {
        file: PathBuf,
        /// Upload the job folder without calling sbatch
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the status of jobs, the latest job if none is given
    Status { jobs: Vec<String> },
    /// Download and print the most recent logs of a job
    Log { job: Option<String> },
    /// Cancel a job
    Stop { job: Option<String> },
    /// Download the remote job folder into the local one
    Download { job: Option<String> },
    /// Poll a job until it finishes
    Wait {
        job: Option<String>,
        #[arg(long, default_value = "600")]
        max_seconds: u64,
    },
    /// List the most recent jobs with their status
    List {
        #[arg(short, default_value = "10")]
        n: usize,
    },
    /// Check which configured clusters can be reached
    TestConnections,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("Loading configuration")?;

    match args.command {
        Commands::Submit { file, dry_run } => {
            let descriptor = Message::new(&file)?.read()?;
            let Some(cluster) = descriptor.cluster.clone() else {
                bail!("job {} does not name a cluster", descriptor.name);
            };
            let manager = connect(config, vec![cluster]);
            match manager.schedule(&descriptor, dry_run)? {
                Some(jobid) => println!("Job {} submitted with id {}", descriptor.name, jobid),
                None => println!("Job {} uploaded, not submitted", descriptor.name),
            }
        }
        Commands::Status { jobs } => {
            let jobs = if jobs.is_empty() {
                vec![latest(&config)?]
            } else {
                jobs
            };
            let manager = connect_for_jobs(config, &jobs)?;
            let names: Vec<&str> = jobs.iter().map(String::as_str).collect();
            for info in manager.job_infos(&names)? {
                print_info(&info);
            }
        }
        Commands::Log { job } => {
            let job = job_or_latest(&config, job)?;
            let manager = connect_for_jobs(config, &[job.clone()])?;
            let logs = manager.fetch_logs(&job)?;
            println!("stdout:\n{}", logs.stdout.unwrap_or_default());
            println!("stderr:\n{}", logs.stderr.unwrap_or_default());
            info!("All logs are in {}", logs.log_dir.display());
        }
        Commands::Stop { job } => {
            let job = job_or_latest(&config, job)?;
            let manager = connect_for_jobs(config, &[job.clone()])?;
            manager.stop(&job)?;
            println!("Cancelled job {job}");
        }
        Commands::Download { job } => {
            let job = job_or_latest(&config, job)?;
            let manager = connect_for_jobs(config, &[job.clone()])?;
            match manager.download_job(&job)? {
                Some(path) => println!("Downloaded job {job} into {}", path.display()),
                None => println!("Job {job} has no folder on its cluster"),
            }
        }
        Commands::Wait { job, max_seconds } => {
            let job = job_or_latest(&config, job)?;
            let manager = connect_for_jobs(config, &[job.clone()])?;
            let status = manager.wait_until_done(&job, max_seconds)?;
            println!("{job}: {status}");
        }
        Commands::List { n } => {
            let jobs: Vec<String> = JobManager::offline(config.clone())
                .list_jobs(n)?
                .iter()
                .map(|metadata| metadata.name().to_string())
                .collect();
            let manager = connect_for_jobs(config, &jobs)?;
            let names: Vec<&str> = jobs.iter().map(String::as_str).collect();
            for info in manager.job_infos(&names)? {
                print_info(&info);
            }
        }
        Commands::TestConnections => {
            let clusters: Vec<String> = config.clusters.keys().cloned().collect();
            let manager = connect(config, clusters.clone());
            let connected = manager.connected_clusters();
            for cluster in &clusters {
                let state = if connected.contains(&cluster.as_str()) {
                    "ok"
                } else {
                    "unreachable"
                };
                println!("{cluster}: {state}");
            }
        }
    }
    Ok(())
}

fn connect(config: Config, clusters: Vec<String>) -> JobManager {
    JobManager::connect(config, &clusters, Arc::new(EnvCredentials))
}

/// Connect to the clusters the given jobs were submitted to
fn connect_for_jobs(config: Config, jobs: &[String]) -> anyhow::Result<JobManager> {
    let mut clusters = BTreeSet::new();
    for job in jobs {
        let path = JobPaths::from_name(job, &config.local_path).metadata_path();
        let metadata = JobMetadata::read(&path)
            .with_context(|| format!("Reading metadata of job {job} at {}", path.display()))?;
        clusters.insert(metadata.cluster);
    }
    Ok(connect(config, clusters.into_iter().collect()))
}

fn latest(config: &Config) -> anyhow::Result<String> {
    let job = JobManager::offline(config.clone()).latest_job()?;
    info!("No job given, using the latest job {job}");
    Ok(job)
}

fn job_or_latest(config: &Config, job: Option<String>) -> anyhow::Result<String> {
    match job {
        Some(job) => Ok(job),
        None => latest(config),
    }
}

fn print_info(info: &JobInfo) {
    let jobid = info.jobid.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
    let elapsed = info
        .elapsed_secs
        .map(|secs| format!("{}s", secs))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        info.name,
        info.date,
        info.cluster,
        jobid,
        info.status,
        elapsed,
        info.nodelist.as_deref().unwrap_or("-")
    );
    for task in &info.tasks {
        println!(
            "  {}\t{}\t{}",
            task.raw_id,
            task.state,
            task.elapsed_secs.map(|secs| format!("{}s", secs)).unwrap_or_default()
        );
    }
}
