use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use log::{debug, info, warn};
use russh::client::{self, AuthResult, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;
use tokio::sync::Mutex;

use crate::remote::archive;
use crate::remote::credentials::CredentialProvider;
use crate::remote::{
    ensure_exists, quote_path, shell_quote, tar_stream_command, with_env, with_retries,
    AttemptError, CommandResult, RemoteError, RemoteExecution, RETRY_BACKOFF,
};

const DEFAULT_PORT: u16 = 22;
const IDENTITY_FILES: [&str; 3] = ["id_ed25519", "id_ecdsa", "id_rsa"];

/// Accepts hosts found in known_hosts and learns new ones
struct ClientHandler {
    host: String,
    port: u16,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh::keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                info!("Server key for {}:{} is not in known_hosts, learning it", self.host, self.port);
                russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, server_public_key)?;
                Ok(true)
            }
            Err(err) => {
                warn!("Server key validation failed for {}:{}: {}", self.host, self.port, err);
                Err(anyhow!("server key validation failed for {}:{}: {}", self.host, self.port, err))
            }
        }
    }
}

/// Captured output of one command
struct RawOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    code: i32,
}

/// In-process ssh session to one cluster
///
/// The session is blocking from the caller's point of view: every operation drives a private
/// single threaded tokio runtime to completion. A dropped connection is re-established on the next
/// attempt.
pub struct LibrarySession {
    host: String,
    port: u16,
    user: String,
    credentials: Arc<dyn CredentialProvider>,
    runtime: Runtime,
    handle: Mutex<Option<Handle<ClientHandler>>>,
}

fn connection_error(host: &str, err: impl ToString) -> RemoteError {
    RemoteError::Connection {
        host: host.to_string(),
        message: err.to_string(),
    }
}

/// Split `host[:port]`, the port defaults to 22
fn split_host(host: &str) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse::<u16>() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), DEFAULT_PORT),
        },
        None => (host.to_string(), DEFAULT_PORT),
    }
}

impl LibrarySession {
    /// Connect and authenticate, `host` may carry a port as `host:port`
    pub fn connect(
        host: &str,
        user: Option<&str>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<LibrarySession, RemoteError> {
        let (hostname, port) = split_host(host);
        let user = match user {
            Some(user) => user.to_string(),
            None => std::env::var("USER").unwrap_or_default(),
        };
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let session = LibrarySession {
            host: hostname,
            port,
            user,
            credentials,
            runtime,
            handle: Mutex::new(None),
        };
        session.runtime.block_on(async {
            let handle = session.open().await?;
            *session.handle.lock().await = Some(handle);
            Ok::<(), RemoteError>(())
        })?;
        Ok(session)
    }

    async fn open(&self) -> Result<Handle<ClientHandler>, RemoteError> {
        info!("Establishing ssh connection with {}@{}:{}", self.user, self.host, self.port);
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(60)),
            keepalive_interval: Some(Duration::from_secs(15)),
            ..Default::default()
        });
        let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|err| connection_error(&self.host, err))?
            .next()
            .ok_or_else(|| connection_error(&self.host, "no address found"))?;
        let handler = ClientHandler {
            host: self.host.clone(),
            port: self.port,
        };
        let mut handle = client::connect(config, addr, handler)
            .await
            .map_err(|err| connection_error(&self.host, err))?;
        self.authenticate(&mut handle).await?;
        Ok(handle)
    }

    fn identity_files(&self) -> Vec<PathBuf> {
        let Some(home) = dirs::home_dir() else {
            return Vec::new();
        };
        IDENTITY_FILES
            .iter()
            .map(|name| home.join(".ssh").join(name))
            .filter(|path| path.is_file())
            .collect()
    }

    /// Public keys first, then a password if the credential provider has one
    async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<(), RemoteError> {
        for key_path in self.identity_files() {
            let key = match russh::keys::load_secret_key(&key_path, None) {
                Ok(key) => key,
                Err(_) => match self.credentials.passphrase(&key_path) {
                    Some(passphrase) => {
                        match russh::keys::load_secret_key(&key_path, Some(&passphrase)) {
                            Ok(key) => key,
                            Err(err) => {
                                warn!("Can't unlock {}: {}", key_path.display(), err);
                                continue;
                            }
                        }
                    }
                    None => continue,
                },
            };
            let hash = handle
                .best_supported_rsa_hash()
                .await
                .map_err(|err| connection_error(&self.host, err))?
                .flatten();
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
            let result = handle
                .authenticate_publickey(self.user.clone(), key)
                .await
                .map_err(|err| connection_error(&self.host, err))?;
            if matches!(result, AuthResult::Success) {
                debug!("Authenticated with {}", key_path.display());
                return Ok(());
            }
        }

        if let Some(password) = self.credentials.password(&self.user, &self.host) {
            let result = handle
                .authenticate_password(self.user.clone(), password)
                .await
                .map_err(|err| connection_error(&self.host, err))?;
            if matches!(result, AuthResult::Success) {
                return Ok(());
            }
        }

        Err(RemoteError::Authentication {
            host: self.host.clone(),
            message: format!("no accepted key or password for {}", self.user),
        })
    }

    /// Reconnect if the connection was dropped
    async fn ensure_connected(
        &self,
        slot: &mut Option<Handle<ClientHandler>>,
    ) -> Result<(), RemoteError> {
        let needs_connect = match slot.as_ref() {
            None => true,
            Some(handle) => handle.is_closed(),
        };
        if needs_connect {
            *slot = Some(self.open().await?);
        }
        Ok(())
    }

    async fn exec_once(&self, command: &str, pty: bool) -> Result<RawOutput, AttemptError> {
        let mut slot = self.handle.lock().await;
        self.ensure_connected(&mut slot).await.map_err(|err| match err {
            RemoteError::Connection { message, .. } => AttemptError::Transient(message),
            other => AttemptError::Fatal(other),
        })?;
        let handle = slot
            .as_ref()
            .ok_or_else(|| AttemptError::Transient("ssh handle lost".to_string()))?;

        let transient = |err: russh::Error| AttemptError::Transient(err.to_string());
        let mut channel = handle.channel_open_session().await.map_err(transient)?;
        if pty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(transient)?;
        }
        channel.exec(true, command).await.map_err(transient)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => code = Some(exit_status as i32),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
        match code {
            Some(code) => Ok(RawOutput {
                stdout,
                stderr,
                code,
            }),
            None => Err(AttemptError::Transient(format!(
                "channel closed before `{command}` reported an exit status"
            ))),
        }
    }

    async fn sftp(&self) -> Result<SftpSession, RemoteError> {
        let mut slot = self.handle.lock().await;
        self.ensure_connected(&mut slot).await?;
        let handle = slot
            .as_ref()
            .ok_or_else(|| connection_error(&self.host, "ssh handle lost before opening sftp"))?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|err| connection_error(&self.host, err))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|err| connection_error(&self.host, err))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|err| connection_error(&self.host, err))
    }

    fn exec_checked(&self, command: &str) -> Result<RawOutput, RemoteError> {
        let output = self
            .runtime
            .block_on(self.exec_once(command, false))
            .map_err(|err| match err {
                AttemptError::Fatal(err) => err,
                AttemptError::Transient(message) => connection_error(&self.host, message),
            })?;
        if output.code != 0 {
            return Err(RemoteError::Command {
                command: command.to_string(),
                code: output.code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output)
    }

    fn mkdir(&self, dir: &Path) -> Result<(), RemoteError> {
        self.exec_checked(&format!("mkdir -p {}", quote_path(dir)))
            .map(|_| ())
    }
}

impl RemoteExecution for LibrarySession {
    fn run(
        &self,
        command: &str,
        pty: bool,
        env: Option<&BTreeMap<String, String>>,
        retries: u32,
    ) -> Result<CommandResult, RemoteError> {
        let full_command = with_env(command, env);
        with_retries(command, retries, RETRY_BACKOFF, || {
            let output = self.runtime.block_on(self.exec_once(&full_command, pty))?;
            Ok(CommandResult::new(
                command,
                output.code,
                String::from_utf8_lossy(&output.stdout).into_owned(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ))
        })
    }

    fn upload_file(&self, local: &Path, remote: &Path) -> Result<(), RemoteError> {
        if let Some(parent) = remote.parent() {
            self.mkdir(parent)?;
        }
        let remote_path = remote.to_string_lossy().into_owned();
        self.runtime.block_on(async {
            let content = tokio::fs::read(local).await?;
            let sftp = self.sftp().await?;
            let mut file = sftp
                .create(remote_path.as_str())
                .await
                .map_err(|err| connection_error(&self.host, err))?;
            file.write_all(&content).await?;
            file.shutdown().await?;
            debug!("Sent {} bytes to {}", content.len(), remote_path);
            Ok(())
        })
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
        self.upload_file(&archive_path, &remote_parent.join(&archive_name))?;
        let extract = format!(
            "cd {} && tar -xf {name} && rm {name}",
            quote_path(remote_parent),
            name = shell_quote(&archive_name)
        );
        self.exec_checked(&extract).map(|_| ())
    }

    fn download_file(&self, remote: &Path, local: &Path) -> Result<(), RemoteError> {
        ensure_exists(self, remote)?;
        let remote_path = remote.to_string_lossy().into_owned();
        let content = self.runtime.block_on(async {
            let sftp = self.sftp().await?;
            let mut file = sftp
                .open(remote_path.as_str())
                .await
                .map_err(|err| connection_error(&self.host, err))?;
            let mut content = Vec::new();
            file.read_to_end(&mut content).await?;
            Ok::<Vec<u8>, RemoteError>(content)
        })?;

        let parent = local.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let mut partial = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut partial, &content)?;
        partial.persist(local).map_err(|err| err.error)?;
        Ok(())
    }

    fn download_folder(&self, remote: &Path, local: &Path) -> Result<(), RemoteError> {
        ensure_exists(self, remote)?;
        let name = archive::folder_name(remote)?;
        info!("Downloading {}:{} into {}", self.host, remote.display(), local.display());
        let output = self.exec_checked(&tar_stream_command(remote))?;
        archive::unpack_merge(output.stdout.as_slice(), &name, local)?;
        Ok(())
    }
}
