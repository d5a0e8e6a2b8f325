use std::fs;
use std::io::Write;
use std::path::Path;

use log::{debug, info};
use serde::Serialize;
use tinytemplate::TinyTemplate;

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::job::descriptor::JobDescriptor;
use crate::job::path::{ARGS_FILE, LOG_DIR};

/// included sbatch script template
static SCRIPT: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/data/templates/slurm_script.sh"
));

/// Aborts a task whose index has no line in the argument file
const ARRAY_GUARD: &str = concat!(
    "\n# checks that python-args.txt has a line for $SLURM_ARRAY_TASK_ID\n",
    "[ \"$(wc -l < python-args.txt)\" -le \"$SLURM_ARRAY_TASK_ID\" ] && ",
    "{ echo \"Error: python-args.txt has no line for task $SLURM_ARRAY_TASK_ID.\" >&2; exit 1; }\n",
);

/// Argument line of the current array task
const ARRAY_ARGUMENT: &str = r#"`sed -n "$(( $SLURM_ARRAY_TASK_ID + 1 ))p" python-args.txt`"#;

/// Rendering context of the sbatch script
///
/// Unset options serialise to null and their directive is skipped by the template.
#[derive(Serialize)]
struct ScriptContext {
    name: String,
    output: String,
    error: String,
    cpus: Option<u32>,
    partition: Option<String>,
    mem: Option<u64>,
    gpus: Option<u32>,
    nodes: Option<u32>,
    account: Option<String>,
    nodelist: Option<String>,
    time: Option<u32>,
    array: Option<String>,
    setup: Option<String>,
    python_path: String,
    guard: Option<String>,
    invocation: String,
}

/// Render the sbatch script of a job
///
/// `entrypoint_path_from_cwd` is relative to the job folder, which is the working directory of
/// the script. `remote_job_path` is put on `PYTHONPATH` together with the shipped libraries.
pub fn render(
    descriptor: &JobDescriptor,
    entrypoint_path_from_cwd: &Path,
    remote_job_path: &Path,
) -> Result<String> {
    render_for_cluster(descriptor, entrypoint_path_from_cwd, remote_job_path, None)
}

/// Like [`render`], the cluster partition and account fill in what the descriptor leaves unset
pub fn render_for_cluster(
    descriptor: &JobDescriptor,
    entrypoint_path_from_cwd: &Path,
    remote_job_path: &Path,
    cluster: Option<&ClusterConfig>,
) -> Result<String> {
    let mut tt = TinyTemplate::new();
    tt.set_default_formatter(&tinytemplate::format_unescaped);
    tt.add_template("slurm_script", SCRIPT)?;

    let context = context(descriptor, entrypoint_path_from_cwd, remote_job_path, cluster);
    let script = tt.render("slurm_script", &context)?;
    debug!("Rendered slurm script for {}:\n{}", descriptor.name, script);
    Ok(script)
}

fn context(
    descriptor: &JobDescriptor,
    entrypoint_path_from_cwd: &Path,
    remote_job_path: &Path,
    cluster: Option<&ClusterConfig>,
) -> ScriptContext {
    let lines = descriptor.argument_lines();
    let (output, error) = match lines {
        // %a is replaced by the task index
        Some(_) => (format!("{LOG_DIR}/%a.stdout"), format!("{LOG_DIR}/%a.stderr")),
        None => (format!("{LOG_DIR}/stdout"), format!("{LOG_DIR}/stderr")),
    };
    let array = lines.as_ref().map(|lines| {
        format!(
            "0-{}%{}",
            lines.len().saturating_sub(1),
            descriptor.n_concurrent_jobs.unwrap_or(1)
        )
    });

    let arguments = match lines {
        Some(_) => ARRAY_ARGUMENT.to_string(),
        None => descriptor.argument_string(),
    };
    let entrypoint = entrypoint_path_from_cwd.display();
    let invocation = match &descriptor.python_binary {
        Some(binary) => format!("{binary} {entrypoint} {arguments}"),
        None => format!("bash {entrypoint} {arguments}"),
    };

    ScriptContext {
        name: descriptor.name.clone(),
        output,
        error,
        cpus: descriptor.n_cpus,
        partition: descriptor
            .partition
            .clone()
            .or_else(|| cluster.and_then(|c| c.default_partition.clone())),
        mem: descriptor.mem,
        gpus: descriptor.n_gpus.filter(|gpus| *gpus > 0),
        nodes: descriptor.nodes,
        account: descriptor
            .account
            .clone()
            .or_else(|| cluster.and_then(|c| c.account.clone())),
        nodelist: descriptor.nodelist.clone(),
        time: descriptor.max_runtime_minutes,
        array,
        setup: descriptor
            .bash_setup_command
            .clone()
            .filter(|setup| !setup.trim().is_empty()),
        python_path: python_path(descriptor, remote_job_path),
        guard: descriptor
            .is_job_array()
            .then(|| ARRAY_GUARD.to_string()),
        invocation: invocation.trim_end().to_string(),
    }
}

/// Remote job folder, extra remote paths and shipped libraries joined with `:`
fn python_path(descriptor: &JobDescriptor, remote_job_path: &Path) -> String {
    let mut paths = vec![remote_job_path.display().to_string()];
    paths.extend(descriptor.python_paths.iter().flatten().cloned());
    paths.extend(
        descriptor
            .library_names()
            .iter()
            .map(|name| remote_job_path.join(name).display().to_string()),
    );
    paths.join(":")
}

/// Write one argument line per array task next to the script
///
/// Returns false without writing anything when the job is not an array.
pub fn write_args_file(descriptor: &JobDescriptor, job_root: &Path) -> Result<bool> {
    let Some(lines) = descriptor.argument_lines() else {
        return Ok(false);
    };
    let out_path = job_root.join(ARGS_FILE);
    info!("Writing {} array arguments to {}", lines.len(), out_path.display());
    let mut file = fs::File::create(&out_path)?;
    for line in lines {
        writeln!(file, "{line}")?;
    }
    Ok(true)
}
