//! Running commands and moving files on a cluster
//!
//! Two interchangeable transports implement [`RemoteExecution`]: one shells out to the `ssh` and
//! `scp` binaries, the other keeps an in-process ssh session. Callers only see the five operations
//! of the trait and the failure classes of [`RemoteError`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error as ThisError;

/// Folder transfers through a single tar archive
pub mod archive;
/// Callback used when a password or key passphrase is needed
pub mod credentials;
/// In-process ssh client
pub mod session;
/// Native `ssh`/`scp` binaries
pub mod subprocess;

/// Delay between two attempts after a connection failure
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of one remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub command: String,
    /// Non zero exit code
    pub failed: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

impl CommandResult {
    pub fn new(command: &str, return_code: i32, stdout: String, stderr: String) -> CommandResult {
        CommandResult {
            command: command.to_string(),
            failed: return_code != 0,
            stdout,
            stderr,
            return_code,
        }
    }

    /// Turn a failed command into an error carrying its stderr
    pub fn check(self) -> Result<CommandResult, RemoteError> {
        if self.failed {
            Err(RemoteError::Command {
                command: self.command,
                code: self.return_code,
                stderr: self.stderr,
            })
        } else {
            Ok(self)
        }
    }
}

#[derive(Debug, ThisError)]
pub enum RemoteError {
    /// Host unreachable or channel broken, the cluster is unusable for this session
    #[error("cannot connect to {host}: {message}")]
    Connection { host: String, message: String },

    #[error("authentication to {host} failed: {message}")]
    Authentication { host: String, message: String },

    #[error("command `{command}` did not succeed after {attempts} attempts: {message}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        message: String,
    },

    /// The remote program itself failed
    #[error("command `{command}` exited with {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("remote path {0} not found")]
    NotFound(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Connection class failures: the cluster should not be used anymore
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            RemoteError::Connection { .. }
                | RemoteError::Authentication { .. }
                | RemoteError::RetriesExhausted { .. }
        )
    }

    /// Recoverable, the caller may treat it as "no data yet"
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// Operations needed on a cluster, independent of the transport
pub trait RemoteExecution {
    /// Run a shell command remotely
    ///
    /// `retries` only applies to connection failures, a command exiting non zero is returned as is
    /// with `failed` set.
    fn run(
        &self,
        command: &str,
        pty: bool,
        env: Option<&BTreeMap<String, String>>,
        retries: u32,
    ) -> Result<CommandResult, RemoteError>;

    fn upload_file(&self, local: &Path, remote: &Path) -> Result<(), RemoteError>;

    /// Copy `local` into the remote folder `remote_parent`, the tree appears there in one piece
    fn upload_folder(&self, local: &Path, remote_parent: &Path) -> Result<(), RemoteError>;

    fn download_file(&self, remote: &Path, local: &Path) -> Result<(), RemoteError>;

    /// Merge the remote folder into `local`
    fn download_folder(&self, remote: &Path, local: &Path) -> Result<(), RemoteError>;
}

/// Result of a single attempt at running a command
pub(crate) enum AttemptError {
    /// Connection dropped or channel error, worth retrying
    Transient(String),
    /// Retrying can't help
    Fatal(RemoteError),
}

/// Run `attempt` until it succeeds, at most `retries + 1` times, sleeping `backoff` in between
///
/// Only [`AttemptError::Transient`] failures are retried.
pub(crate) fn with_retries<F>(
    command: &str,
    retries: u32,
    backoff: Duration,
    mut attempt: F,
) -> Result<CommandResult, RemoteError>
where
    F: FnMut() -> Result<CommandResult, AttemptError>,
{
    let attempts = retries + 1;
    let mut last_message = String::new();
    for trial in 1..=attempts {
        match attempt() {
            Ok(result) => return Ok(result),
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Transient(message)) => {
                debug!("Command {command} failed because of connection issue (attempt {trial}/{attempts}): {message}");
                last_message = message;
                if trial < attempts {
                    thread::sleep(backoff);
                }
            }
        }
    }
    warn!("Command {command} did not succeed after {attempts} attempts");
    Err(RemoteError::RetriesExhausted {
        command: command.to_string(),
        attempts,
        message: last_message,
    })
}

/// Quote a string for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// Quote a path for a POSIX shell
pub fn quote_path(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// Prefix a command with `export` statements
///
/// sshd usually refuses client environment variables, so they are set by the remote shell.
pub fn with_env(command: &str, env: Option<&BTreeMap<String, String>>) -> String {
    match env {
        Some(vars) if !vars.is_empty() => {
            let exports: Vec<String> = vars
                .iter()
                .map(|(key, value)| format!("{}={}", key, shell_quote(value)))
                .collect();
            format!("export {}; {}", exports.join(" "), command)
        }
        _ => command.to_string(),
    }
}

/// Command printing nothing and exiting 1 when a remote path is missing
pub(crate) fn exists_command(path: &Path) -> String {
    format!("test -e {}", quote_path(path))
}

/// Fail with [`RemoteError::NotFound`] when `path` does not exist on the cluster
pub(crate) fn ensure_exists<R: RemoteExecution + ?Sized>(
    remote: &R,
    path: &Path,
) -> Result<(), RemoteError> {
    let result = remote.run(&exists_command(path), false, None, 0)?;
    match result.return_code {
        0 => Ok(()),
        1 => Err(RemoteError::NotFound(path.to_path_buf())),
        _ => result.check().map(|_| ()),
    }
}

/// Command writing a tar stream of `path` to stdout
pub(crate) fn tar_stream_command(path: &Path) -> String {
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    format!("tar -C {} -cf - {}", quote_path(parent), shell_quote(&name))
}
