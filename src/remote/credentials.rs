use std::env;
use std::path::Path;

/// Supplies secrets to the in-process ssh client when key authentication alone is not enough
///
/// Only called when needed, so a non interactive caller never blocks on a prompt.
pub trait CredentialProvider {
    fn password(&self, user: &str, host: &str) -> Option<String>;

    fn passphrase(&self, key_path: &Path) -> Option<String>;
}

/// Never has anything to offer
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn password(&self, _user: &str, _host: &str) -> Option<String> {
        None
    }

    fn passphrase(&self, _key_path: &Path) -> Option<String> {
        None
    }
}

/// Reads `SLURMFERRY_SSH_PASSWORD` and `SLURMFERRY_SSH_PASSPHRASE`
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn password(&self, _user: &str, _host: &str) -> Option<String> {
        env::var("SLURMFERRY_SSH_PASSWORD").ok()
    }

    fn passphrase(&self, _key_path: &Path) -> Option<String> {
        env::var("SLURMFERRY_SSH_PASSPHRASE").ok()
    }
}
