use std::cmp::Reverse;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::job::descriptor::JobDescriptor;
use crate::job::path::METADATA_FILE;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Record of a job written once when the job is created
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobMetadata {
    pub user: String,
    /// Local creation time, `%Y-%m-%d %H:%M:%S%.6f`
    pub date: String,
    pub job_creation_info: JobDescriptor,
    pub cluster: String,
}

/// Content of `jobid.json`
#[derive(Debug, Serialize, Deserialize)]
struct JobIdRecord {
    jobid: u64,
}

impl JobMetadata {
    pub fn new(descriptor: &JobDescriptor, cluster: &str) -> JobMetadata {
        let user = env::var("USER")
            .or_else(|_| env::var("USERNAME"))
            .unwrap_or_default();
        JobMetadata {
            user,
            date: Local::now().format(DATE_FORMAT).to_string(),
            job_creation_info: descriptor.clone(),
            cluster: cluster.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.job_creation_info.name
    }

    /// Creation time, `None` for records with an unreadable date
    pub fn created_at(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.date, "%Y-%m-%d %H:%M:%S%.f").ok()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<JobMetadata> {
        serde_json::from_str(json)
    }

    /// Write the record, failing if the file already exists
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json()?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(json.as_bytes())
    }

    pub fn read(path: &Path) -> io::Result<JobMetadata> {
        let json = fs::read_to_string(path)?;
        Ok(JobMetadata::from_json(&json)?)
    }
}

pub fn write_job_id(path: &Path, jobid: u64) -> io::Result<()> {
    let json = serde_json::to_string(&JobIdRecord { jobid })?;
    fs::write(path, json)
}

/// Recorded slurm job id, `None` if the job never got one
pub fn read_job_id(path: &Path) -> io::Result<Option<u64>> {
    match fs::read_to_string(path) {
        Ok(json) => {
            let record: JobIdRecord = serde_json::from_str(&json)?;
            Ok(Some(record.jobid))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Collect metadata records below `jobs_dir`, most recent first
///
/// Job names can be nested, so the tree is walked with an explicit stack of folders. A folder
/// holding a metadata file is a job folder and is not descended into: its children are the job
/// sources and logs. Unreadable records are skipped.
pub fn list_metadatas(jobs_dir: &Path, limit: Option<usize>) -> io::Result<Vec<JobMetadata>> {
    let mut found: Vec<JobMetadata> = Vec::new();
    if !jobs_dir.is_dir() {
        return Ok(found);
    }

    let mut frontier: Vec<PathBuf> = vec![jobs_dir.to_path_buf()];
    while let Some(dir) = frontier.pop() {
        let metadata_path = dir.join(METADATA_FILE);
        if metadata_path.is_file() {
            match JobMetadata::read(&metadata_path) {
                Ok(metadata) => found.push(metadata),
                Err(err) => warn!("Skipping unreadable metadata {}: {}", metadata_path.display(), err),
            }
            continue;
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                frontier.push(path);
            }
        }
    }
    debug!("Found {} jobs in {}", found.len(), jobs_dir.display());

    found.sort_by_key(|metadata| Reverse(metadata.created_at()));
    if let Some(limit) = limit {
        found.truncate(limit);
    }
    Ok(found)
}
