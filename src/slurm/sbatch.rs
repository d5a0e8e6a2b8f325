use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::job::path::{LOG_DIR, SCRIPT_FILE};
use crate::remote::{quote_path, shell_quote};

/// Columns requested from sacct, in order
pub const SACCT_FORMAT: &str = "JobID,Elapsed,start,State,nodelist";

/// Variable always exported to the job with its name
pub const JOBNAME_VAR: &str = "SLURMFERRY_JOBNAME";

/// `--export` value: all of the submitting environment plus the job variables
///
/// Values containing separators are single quoted, the quotes are removed by the remote shell.
pub fn export_argument(name: &str, env: Option<&BTreeMap<String, String>>) -> String {
    let mut exports = vec!["ALL".to_string(), format!("{JOBNAME_VAR}={}", shell_quote(name))];
    exports.extend(
        env.into_iter()
            .flatten()
            .filter(|(key, _)| key.as_str() != JOBNAME_VAR)
            .map(|(key, value)| format!("{key}={}", shell_quote(value))),
    );
    format!("--export={}", exports.join(","))
}

/// Command creating the log folder and submitting the script from the remote job folder
pub fn submit_command(
    remote_job_dir: &Path,
    sbatch_arguments: Option<&str>,
    export: &str,
) -> String {
    let mut sbatch = vec!["sbatch".to_string()];
    if let Some(extra) = sbatch_arguments.map(str::trim).filter(|extra| !extra.is_empty()) {
        sbatch.push(extra.to_string());
    }
    sbatch.push(export.to_string());
    sbatch.push(SCRIPT_FILE.to_string());
    format!(
        "cd {}; mkdir -p {LOG_DIR}/; {}",
        quote_path(remote_job_dir),
        sbatch.join(" ")
    )
}

pub fn cancel_command(jobid: u64) -> String {
    format!("scancel {jobid}")
}

/// One accounting query covering all given job ids
pub fn sacct_command(jobids: &[u64]) -> String {
    let ids: Vec<String> = jobids.iter().map(u64::to_string).collect();
    format!(
        "sacct --format=\"{SACCT_FORMAT}\" -X -p --jobs={}",
        ids.join(",")
    )
}

fn submission_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"Submitted batch job (\d+)").ok())
        .as_ref()
}

/// Job id announced by sbatch, `None` if the output does not match
pub fn parse_submission(stdout: &str) -> Option<u64> {
    submission_pattern()?
        .captures(stdout)
        .and_then(|captures| captures.get(1))
        .and_then(|id| id.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_command_runs_from_job_folder() {
        let export = export_argument("exp/run-1", None);
        assert_eq!(export, "--export=ALL,SLURMFERRY_JOBNAME=exp/run-1");
        assert_eq!(
            submit_command(Path::new("/r/slurmferry/jobs/exp/run-1"), None, &export),
            "cd /r/slurmferry/jobs/exp/run-1; mkdir -p logs/; sbatch --export=ALL,SLURMFERRY_JOBNAME=exp/run-1 slurm_script.sh"
        );
    }

    #[test]
    fn extra_flags_come_before_export() {
        let command = submit_command(Path::new("/r/j"), Some(" --qos=high "), "--export=ALL");
        assert!(command.ends_with("sbatch --qos=high --export=ALL slurm_script.sh"));
    }

    #[test]
    fn descriptor_env_is_exported() {
        let mut env = BTreeMap::new();
        env.insert("SEED".to_string(), "3".to_string());
        env.insert("MSG".to_string(), "hello world".to_string());
        assert_eq!(
            export_argument("job", Some(&env)),
            "--export=ALL,SLURMFERRY_JOBNAME=job,MSG='hello world',SEED=3"
        );
    }

    #[test]
    fn sacct_queries_all_ids_at_once() {
        assert_eq!(
            sacct_command(&[12, 15]),
            "sacct --format=\"JobID,Elapsed,start,State,nodelist\" -X -p --jobs=12,15"
        );
        assert_eq!(cancel_command(12), "scancel 12");
    }

    #[test]
    fn submission_output_is_parsed() {
        assert_eq!(parse_submission("Submitted batch job 4242\n"), Some(4242));
        assert_eq!(
            parse_submission("sbatch: note: x\nSubmitted batch job 7 on cluster a\n"),
            Some(7)
        );
        assert_eq!(parse_submission("sbatch: error: Batch job submission failed"), None);
        assert_eq!(parse_submission(""), None);
    }

    #[test]
    fn submission_pattern_is_compiled_once() {
        let first = submission_pattern().unwrap();
        let second = submission_pattern().unwrap();
        assert!(std::ptr::eq(first, second));
    }
}
