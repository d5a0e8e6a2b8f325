use std::collections::BTreeMap;

use log::warn;

use crate::job::state::JobStatus;

/// One row of `sacct -p` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SacctRow {
    /// Job id as printed, `123` or `123_4` for an array task
    pub raw_id: String,
    /// Parent job id
    pub jobid: u64,
    /// Array task index, also absent for the `123_[0-9%2]` rows of pending arrays
    pub task: Option<u32>,
    pub elapsed_secs: Option<u64>,
    pub start: Option<String>,
    pub state: JobStatus,
    pub nodelist: Option<String>,
}

/// `"1-02:03:04"` -> 93784, `"02:03:04"` -> 7384, `"03:04"` -> 184
pub fn parse_elapsed(elapsed: &str) -> Option<u64> {
    let elapsed = elapsed.trim();
    let (days, clock) = match elapsed.split_once('-') {
        Some((days, clock)) => (days.parse::<u64>().ok()?, clock),
        None => (0, elapsed),
    };
    let parts = clock
        .split(':')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => (0, *m, *s),
        _ => return None,
    };
    Some(days * 86_400 + hours * 3_600 + minutes * 60 + seconds)
}

/// Split `parent_task` ids, a task index that is not a number is dropped
pub fn split_job_id(raw_id: &str) -> Option<(u64, Option<u32>)> {
    match raw_id.split_once('_') {
        Some((parent, task)) => Some((parent.parse().ok()?, task.parse().ok())),
        None => Some((raw_id.parse().ok()?, None)),
    }
}

fn optional(field: Option<&&str>) -> Option<String> {
    field
        .map(|value| value.trim())
        .filter(|value| !value.is_empty() && !matches!(*value, "Unknown" | "None" | "None assigned"))
        .map(str::to_string)
}

/// Parse pipe delimited sacct output, the first line being the header
///
/// Rows that can't be read are logged and skipped.
pub fn parse_table(output: &str) -> Vec<SacctRow> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<String> = fields(header).iter().map(|c| c.to_lowercase()).collect();
    let index = |name: &str| columns.iter().position(|column| column == name);
    let (Some(id_col), Some(state_col)) = (index("jobid"), index("state")) else {
        warn!("Unexpected sacct header: {header}");
        return Vec::new();
    };
    let elapsed_col = index("elapsed");
    let start_col = index("start");
    let nodelist_col = index("nodelist");

    let mut rows = Vec::new();
    for line in lines {
        let values = fields(line);
        if values.len() != columns.len() {
            warn!("Skipping sacct row with {} fields instead of {}: {line}", values.len(), columns.len());
            continue;
        }
        let raw_id = values[id_col].trim();
        let Some((jobid, task)) = split_job_id(raw_id) else {
            warn!("Skipping sacct row with unreadable job id: {line}");
            continue;
        };
        rows.push(SacctRow {
            raw_id: raw_id.to_string(),
            jobid,
            task,
            elapsed_secs: elapsed_col.and_then(|col| parse_elapsed(values[col])),
            start: optional(start_col.and_then(|col| values.get(col))),
            state: JobStatus::from_sacct(values[state_col]),
            nodelist: optional(nodelist_col.and_then(|col| values.get(col))),
        });
    }
    rows
}

/// `-p` ends every line with a delimiter, the empty field after it is dropped
fn fields(line: &str) -> Vec<&str> {
    let line = line.trim_end();
    line.strip_suffix('|').unwrap_or(line).split('|').collect()
}

/// Rows grouped by parent job id
pub fn by_job(rows: Vec<SacctRow>) -> BTreeMap<u64, Vec<SacctRow>> {
    let mut jobs: BTreeMap<u64, Vec<SacctRow>> = BTreeMap::new();
    for row in rows {
        jobs.entry(row.jobid).or_default().push(row);
    }
    jobs
}

/// Single status for a job made of several rows
///
/// An array is running while any task runs, then pending while any task waits, then the worst
/// outcome among its tasks.
pub fn summarize(rows: &[SacctRow]) -> JobStatus {
    rows.iter()
        .map(|row| row.state)
        .max_by_key(JobStatus::precedence)
        .unwrap_or(JobStatus::Unknown)
}
