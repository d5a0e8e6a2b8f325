//! Render sbatch scripts and talk to the slurm command line tools

/// Render the sbatch script of a job with TinyTemplate
pub mod script;

/// Text of the sbatch, scancel and sacct commands, parsing of the sbatch answer
pub mod sbatch;

/// Parse sacct accounting tables
pub mod sacct;
