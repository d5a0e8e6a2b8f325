//! Job description, on-disk layout and persisted metadata
//!
//! A job is identified by its name. Everything the client knows about a job lives under
//! `<root>/jobs/<name>/`, both locally and on the cluster, so the name is the only key needed to
//! find the metadata, the slurm job id and the logs of a job again.

/// The user facing description of a job and its validation rules
pub mod descriptor;
/// Durable record written once per job at submission time
pub mod metadata;
/// Mapping from a job name to local and remote file layouts
pub mod path;
/// Job states reported by the scheduler
pub mod state;
