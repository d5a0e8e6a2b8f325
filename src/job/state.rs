use std::fmt;

/// State of a job as reported by `sacct`
///
/// `Unknown` is local: it is used when no job id was recorded (submission failed before sbatch
/// answered) or when the cluster owning the job could not be queried.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    OutOfMemory,
    Unknown,
}

impl JobStatus {
    /// Map a sacct `State` column onto a status
    ///
    /// sacct decorates some states, e.g. `CANCELLED by 25416`, only the first word is used. An empty
    /// state happens right after submission, before the accounting database knows about the job.
    pub fn from_sacct(state: &str) -> JobStatus {
        let word = state.split_whitespace().next().unwrap_or_default();
        match word.trim_end_matches('+') {
            "" | "PENDING" | "REQUEUED" | "SUSPENDED" | "RESIZING" => JobStatus::Pending,
            "RUNNING" | "COMPLETING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" | "NODE_FAIL" | "BOOT_FAIL" | "DEADLINE" | "PREEMPTED" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Cancelled,
            "TIMEOUT" => JobStatus::Timeout,
            "OUT_OF_MEMORY" => JobStatus::OutOfMemory,
            _ => JobStatus::Unknown,
        }
    }

    /// The job will not change state anymore
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::Timeout
                | JobStatus::OutOfMemory
        )
    }

    /// Ranking used to summarise the tasks of a job array into one status, highest wins
    pub(crate) fn precedence(&self) -> u8 {
        match self {
            JobStatus::Running => 7,
            JobStatus::Pending => 6,
            JobStatus::Failed => 5,
            JobStatus::OutOfMemory => 4,
            JobStatus::Timeout => 3,
            JobStatus::Cancelled => 2,
            JobStatus::Completed => 1,
            JobStatus::Unknown => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::OutOfMemory => "OUT_OF_MEMORY",
            JobStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
