use std::collections::BTreeMap;
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

use log::{debug, info};

use crate::remote::archive;
use crate::remote::{
    ensure_exists, quote_path, shell_quote, tar_stream_command, with_env, with_retries,
    AttemptError, CommandResult, RemoteError, RemoteExecution, RETRY_BACKOFF,
};

/// ssh reserves this exit code for its own failures, remote programs may use it too
const SSH_FAILURE_CODE: i32 = 255;
/// stderr of ssh when the connection broke, retrying may help
const TRANSIENT_FAILURES: [&str; 9] = [
    "Connection reset",
    "Connection timed out",
    "Connection closed",
    "closed by remote host",
    "Connection refused",
    "kex_exchange_identification",
    "Broken pipe",
    "Network is unreachable",
    "No route to host",
];

/// Runs commands through the `ssh` and `scp` binaries of this machine
///
/// Host aliases, proxies and keys from `~/.ssh/config` apply as for a manual login. `BatchMode` is
/// set so a missing key fails instead of prompting.
#[derive(Debug, Clone)]
pub struct SubprocessSession {
    host: String,
    user: Option<String>,
    /// Program and leading arguments standing for `ssh`
    ssh_program: Vec<String>,
    backoff: Duration,
}

impl SubprocessSession {
    pub fn new(host: &str, user: Option<&str>) -> SubprocessSession {
        SubprocessSession {
            host: host.to_string(),
            user: user.map(str::to_string),
            ssh_program: vec!["ssh".to_string()],
            backoff: RETRY_BACKOFF,
        }
    }

    fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn exec(&self, command: &str, pty: bool) -> Result<Output, AttemptError> {
        let (program, leading) = match self.ssh_program.split_first() {
            Some((program, leading)) => (program.as_str(), leading),
            None => ("ssh", &[][..]),
        };
        let mut ssh = Command::new(program);
        ssh.args(leading).args(["-o", "BatchMode=yes"]);
        if pty {
            ssh.arg("-tt");
        }
        ssh.arg(self.destination()).arg("--").arg(command);
        debug!("{:?}", &ssh);

        let output = ssh
            .output()
            .map_err(|err| AttemptError::Fatal(RemoteError::Io(err)))?;
        match output.status.code() {
            Some(SSH_FAILURE_CODE) => match self.classify(&String::from_utf8_lossy(&output.stderr)) {
                Some(err) => Err(err),
                None => Ok(output),
            },
            None => Err(AttemptError::Transient(format!(
                "ssh was interrupted: {}",
                output.status
            ))),
            Some(_) => Ok(output),
        }
    }

    /// Sort an exit code 255 into ssh failures, retryable or not
    ///
    /// `None` when stderr does not come from ssh: the remote program exited 255 itself.
    fn classify(&self, stderr: &str) -> Option<AttemptError> {
        let message = stderr.trim().to_string();
        if message.contains("Permission denied") || message.contains("Host key verification failed") {
            Some(AttemptError::Fatal(RemoteError::Authentication {
                host: self.host.clone(),
                message,
            }))
        } else if message.contains("Could not resolve hostname") {
            Some(AttemptError::Fatal(RemoteError::Connection {
                host: self.host.clone(),
                message,
            }))
        } else if message.starts_with("ssh:")
            || TRANSIENT_FAILURES.iter().any(|pattern| message.contains(pattern))
        {
            Some(AttemptError::Transient(message))
        } else {
            None
        }
    }

    fn scp(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let mut scp = Command::new("scp");
        scp.args(["-o", "BatchMode=yes", "-q"]).arg(from).arg(to);
        debug!("{:?}", &scp);

        let output = scp.output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RemoteError::Command {
                command: format!("scp {from} {to}"),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    fn remote_target(&self, path: &Path) -> String {
        format!("{}:{}", self.destination(), path.display())
    }

    fn mkdir(&self, dir: &Path) -> Result<(), RemoteError> {
        self.run(&format!("mkdir -p {}", quote_path(dir)), false, None, 0)?
            .check()
            .map(|_| ())
    }
}

impl RemoteExecution for SubprocessSession {
    fn run(
        &self,
        command: &str,
        pty: bool,
        env: Option<&BTreeMap<String, String>>,
        retries: u32,
    ) -> Result<CommandResult, RemoteError> {
        let full_command = with_env(command, env);
        with_retries(command, retries, self.backoff, || {
            let output = self.exec(&full_command, pty)?;
            Ok(CommandResult::new(
                command,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        })
    }

    fn upload_file(&self, local: &Path, remote: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = remote.parent() {
            self.mkdir(parent)?;
        }
        self.scp(&local.to_string_lossy(), &self.remote_target(remote))
    }

    fn upload_folder(&self, local: &Path, remote_parent: &Path) -> Result<(), RemoteError> {
        let staging = tempfile::tempdir()?;
        let archive_path = archive::pack(local, staging.path())?;
        let archive_name = archive::archive_name(local)?;
        info!(
            "Sending {} to {}:{}",
            archive_path.display(),
            self.host,
            remote_parent.display()
        );

        self.mkdir(remote_parent)?;
        self.scp(
            &archive_path.to_string_lossy(),
            &self.remote_target(&remote_parent.join(&archive_name)),
        )?;
        let extract = format!(
            "cd {} && tar -xf {name} && rm {name}",
            quote_path(remote_parent),
            name = shell_quote(&archive_name)
        );
        self.run(&extract, false, None, 0)?.check().map(|_| ())
    }

    fn download_file(&self, remote: &Path, local: &Path) -> Result<(), RemoteError> {
        ensure_exists(self, remote)?;
        let parent = local.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let partial = tempfile::NamedTempFile::new_in(parent)?;
        self.scp(&self.remote_target(remote), &partial.path().to_string_lossy())?;
        partial.persist(local).map_err(|err| err.error)?;
        Ok(())
    }

    fn download_folder(&self, remote: &Path, local: &Path) -> Result<(), RemoteError> {
        ensure_exists(self, remote)?;
        let name = archive::folder_name(remote)?;
        info!("Downloading {}:{} into {}", self.host, remote.display(), local.display());

        let command = tar_stream_command(remote);
        let output = self.exec(&command, false).map_err(|err| match err {
            AttemptError::Fatal(err) => err,
            AttemptError::Transient(message) => RemoteError::Connection {
                host: self.host.clone(),
                message,
            },
        })?;
        if !output.status.success() {
            return Err(RemoteError::Command {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        archive::unpack_merge(output.stdout.as_slice(), &name, local)?;
        Ok(())
    }
}
