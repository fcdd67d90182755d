//! Password generation and credential application
//!
//! Passwords are set through the system's batch mechanism (`chpasswd`); key
//! auth is a single root-owned file per user whose directives strip every
//! sshd capability except port forwarding.

use crate::exec::CommandRunner;
use crate::{Error, Result, SystemPaths};
use base64::engine::general_purpose;
use rand::rngs::OsRng;
use rand::Rng;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

/// Generated passwords are sized for human transcription, not maximum
/// entropy density.
const PASSWORD_LENGTH: usize = 16;

/// Key line prefix: `restrict` disables everything sshd can grant (shell,
/// agent/X11/remote forwarding, PTY), `port-forwarding` re-enables exactly
/// the local/SOCKS capability tunnel users need.
const KEY_RESTRICTIONS: &str = "restrict,port-forwarding";

/// Generate a random alphanumeric password of exactly 16 characters.
///
/// Draws 18 bytes from the OS RNG, base64-encodes, strips the symbols, and
/// truncates; draws again in the rare case stripping leaves fewer than 16
/// characters.
pub fn generate_password() -> String {
    let mut password = String::new();
    while password.len() < PASSWORD_LENGTH {
        let mut buf = [0u8; 18];
        OsRng.fill(&mut buf);
        let encoded = base64::Engine::encode(&general_purpose::STANDARD, buf);
        password.push_str(&encoded.replace(['/', '+', '='], ""));
    }
    password.truncate(PASSWORD_LENGTH);
    password
}

/// Validate an SSH public key format.
///
/// A syntactic prefix check only; the key body is not parsed.
pub fn validate_public_key(key: &str) -> Result<()> {
    let re = regex::Regex::new(r"^(ssh-rsa|ssh-ed25519|ecdsa-sha2-nistp\d+|ssh-dss) ").unwrap();
    if !re.is_match(key) {
        return Err(Error::validation("invalid public key format"));
    }
    Ok(())
}

/// Applies credentials to accounts: batch password set, restricted key files.
pub struct CredentialSetter<'r> {
    runner: &'r dyn CommandRunner,
    paths: SystemPaths,
}

impl<'r> CredentialSetter<'r> {
    pub fn new(runner: &'r dyn CommandRunner, paths: SystemPaths) -> Self {
        Self { runner, paths }
    }

    /// Set the account password via `chpasswd`.
    pub fn set_password(&self, username: &str, password: &str) -> Result<()> {
        self.runner
            .run_with_stdin("chpasswd", &[], &format!("{}:{}", username, password))?
            .expect_success("chpasswd")?;
        Ok(())
    }

    /// Write the restricted key file for a key-mode user, overwriting any
    /// previous file.
    pub fn setup_ssh_key(&self, username: &str, public_key: &str) -> Result<()> {
        validate_public_key(public_key)?;

        fs::create_dir_all(&self.paths.authorized_keys_dir)?;

        let key_file = self.key_file_path(username);
        fs::write(&key_file, format!("{} {}\n", KEY_RESTRICTIONS, public_key))?;
        fs::set_permissions(&key_file, fs::Permissions::from_mode(0o600))?;

        let key_file_str = key_file.to_string_lossy();
        self.runner
            .run("chown", &["root:root", &key_file_str])?
            .expect_success("chown")?;

        Ok(())
    }

    /// Path of the per-user key file.
    pub fn key_file_path(&self, username: &str) -> PathBuf {
        self.paths.authorized_keys_dir.join(username)
    }
}
