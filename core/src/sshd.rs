//! sshd hardening drop-ins
//!
//! Two fragment files under the sshd drop-in directory: a hardening snippet
//! covering crypto/rate-limits/audit logging plus a Match block that strips
//! tunnel-group sessions down to local port forwarding, and a directive
//! pointing key-mode users at the per-user restricted key directory. The set
//! is written all-or-nothing; presence of any file of the set means
//! "configured".

use crate::exec::CommandRunner;
use crate::{Result, Settings};
use std::fs;
use std::path::PathBuf;
use tracing::info;

const HARDENING_FILE: &str = "60-sshtun-hardening.conf";
const AUTHORIZED_KEYS_FILE: &str = "61-sshtun-authkeys.conf";

/// Writes and removes the sshd hardening drop-in set.
pub struct SshdConfigurator<'r> {
    runner: &'r dyn CommandRunner,
    settings: Settings,
}

impl<'r> SshdConfigurator<'r> {
    pub fn new(runner: &'r dyn CommandRunner, settings: Settings) -> Self {
        Self { runner, settings }
    }

    /// Idempotently write the full drop-in set and reload sshd.
    ///
    /// Both files are staged to temporary names and renamed into place so a
    /// failure never leaves a half-written fragment for sshd to parse.
    pub fn configure(&self) -> Result<()> {
        fs::create_dir_all(&self.settings.paths.sshd_config_dir)?;

        let files = [
            (self.hardening_path(), self.hardening_content()),
            (self.authorized_keys_path(), self.authorized_keys_content()),
        ];

        let mut staged = Vec::new();
        for (path, content) in &files {
            let tmp = path.with_extension("conf.tmp");
            if let Err(e) = fs::write(&tmp, content) {
                for t in &staged {
                    let _ = fs::remove_file(t);
                }
                return Err(e.into());
            }
            staged.push(tmp);
        }

        for ((path, _), tmp) in files.iter().zip(&staged) {
            if let Err(e) = fs::rename(tmp, path) {
                for t in &staged {
                    let _ = fs::remove_file(t);
                }
                return Err(e.into());
            }
        }

        self.reload_sshd()?;
        info!("sshd hardening configured");
        Ok(())
    }

    /// Ensure the directive pointing at the per-user key directory exists.
    /// File-per-directive, so it is present exactly once; repeat calls are
    /// no-ops.
    pub fn add_authorized_keys_directive(&self) -> Result<()> {
        let path = self.authorized_keys_path();
        if path.exists() {
            return Ok(());
        }

        fs::create_dir_all(&self.settings.paths.sshd_config_dir)?;
        let tmp = path.with_extension("conf.tmp");
        fs::write(&tmp, self.authorized_keys_content())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Delete the drop-in set and reload sshd. A no-op when nothing of the
    /// set is present.
    pub fn remove_and_reload(&self) -> Result<()> {
        let mut removed = false;
        for path in [self.hardening_path(), self.authorized_keys_path()] {
            if path.exists() {
                fs::remove_file(&path)?;
                removed = true;
            }
        }

        if removed {
            self.reload_sshd()?;
            info!("sshd hardening removed");
        }
        Ok(())
    }

    /// True iff any file of the drop-in set is present.
    pub fn is_configured(&self) -> bool {
        self.hardening_path().exists() || self.authorized_keys_path().exists()
    }

    fn hardening_path(&self) -> PathBuf {
        self.settings.paths.sshd_config_dir.join(HARDENING_FILE)
    }

    fn authorized_keys_path(&self) -> PathBuf {
        self.settings
            .paths
            .sshd_config_dir
            .join(AUTHORIZED_KEYS_FILE)
    }

    fn hardening_content(&self) -> String {
        format!(
            r#"# Managed by sshtun-user. Do not edit; changes are overwritten.

# Modern algorithms only
Ciphers chacha20-poly1305@openssh.com,aes256-gcm@openssh.com,aes128-gcm@openssh.com
KexAlgorithms curve25519-sha256,curve25519-sha256@libssh.org,diffie-hellman-group16-sha512
MACs hmac-sha2-512-etm@openssh.com,hmac-sha2-256-etm@openssh.com

# Connection limits and keepalive
LoginGraceTime 30
MaxAuthTries 3
MaxSessions 10
MaxStartups 10:30:60
ClientAliveInterval 300
ClientAliveCountMax 2

# Audit trail
LogLevel VERBOSE

Match Group {password_group},{key_group}
    AllowTcpForwarding local
    X11Forwarding no
    AllowAgentForwarding no
    PermitTunnel no
    PermitTTY no
    ForceCommand /usr/sbin/nologin
"#,
            password_group = self.settings.password_group,
            key_group = self.settings.key_group,
        )
    }

    fn authorized_keys_content(&self) -> String {
        format!(
            r#"# Managed by sshtun-user. Restricted keys for key-mode tunnel users.
Match Group {key_group}
    AuthorizedKeysFile {keys_dir}/%u
"#,
            key_group = self.settings.key_group,
            keys_dir = self.settings.paths.authorized_keys_dir.display(),
        )
    }

    /// Reload the daemon; the unit is named `sshd` on some distributions and
    /// `ssh` on others.
    fn reload_sshd(&self) -> Result<()> {
        let first = self.runner.run("systemctl", &["reload", "sshd"])?;
        if first.success() {
            return Ok(());
        }

        self.runner
            .run("systemctl", &["reload", "ssh"])?
            .expect_success("systemctl reload ssh")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;
    use tempfile::tempdir;

    fn configurator<'r>(runner: &'r FakeRunner, root: &std::path::Path) -> SshdConfigurator<'r> {
        SshdConfigurator::new(runner, Settings::rooted_at(root))
    }

    #[test]
    fn test_configure_writes_set_and_reloads() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let sshd = configurator(&runner, dir.path());

        assert!(!sshd.is_configured());
        sshd.configure().unwrap();
        assert!(sshd.is_configured());

        let hardening = fs::read_to_string(sshd.hardening_path()).unwrap();
        assert!(hardening.contains("Ciphers chacha20-poly1305@openssh.com"));
        assert!(hardening.contains("LogLevel VERBOSE"));
        assert!(hardening.contains("Match Group sshtunnel-password,sshtunnel-key"));
        assert!(hardening.contains("AllowTcpForwarding local"));
        assert!(hardening.contains("PermitTTY no"));
        assert!(hardening.contains("ForceCommand /usr/sbin/nologin"));

        let authkeys = fs::read_to_string(sshd.authorized_keys_path()).unwrap();
        assert!(authkeys.contains("Match Group sshtunnel-key"));
        assert!(authkeys.contains("AuthorizedKeysFile"));
        assert!(authkeys.contains("/%u"));

        let reloads = runner.calls_for("systemctl");
        assert_eq!(reloads.len(), 1);
        assert!(reloads[0].has_arg("reload"));
        assert!(reloads[0].has_arg("sshd"));

        // no stray temp files
        let leftovers: Vec<_> = fs::read_dir(&sshd.settings.paths.sshd_config_dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "tmp")
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_configure_is_idempotent() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let sshd = configurator(&runner, dir.path());

        sshd.configure().unwrap();
        sshd.configure().unwrap();
        assert!(sshd.is_configured());
    }

    #[test]
    fn test_reload_falls_back_to_ssh_unit() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        runner.fail_when("systemctl", "sshd", "Unit sshd.service not found");
        let sshd = configurator(&runner, dir.path());

        sshd.configure().unwrap();

        let reloads = runner.calls_for("systemctl");
        assert_eq!(reloads.len(), 2);
        assert!(reloads[1].has_arg("ssh"));
    }

    #[test]
    fn test_add_authorized_keys_directive_idempotent() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let sshd = configurator(&runner, dir.path());

        sshd.add_authorized_keys_directive().unwrap();
        sshd.add_authorized_keys_directive().unwrap();

        assert!(sshd.authorized_keys_path().exists());
        assert!(!sshd.hardening_path().exists());
        // directive alone marks the system as configured
        assert!(sshd.is_configured());
    }

    #[test]
    fn test_remove_and_reload() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let sshd = configurator(&runner, dir.path());

        sshd.configure().unwrap();
        sshd.remove_and_reload().unwrap();

        assert!(!sshd.is_configured());
        // one reload from configure, one from removal
        assert_eq!(runner.calls_for("systemctl").len(), 2);
    }

    #[test]
    fn test_remove_when_absent_is_noop() {
        let dir = tempdir().unwrap();
        let runner = FakeRunner::new();
        let sshd = configurator(&runner, dir.path());

        sshd.remove_and_reload().unwrap();
        assert!(!runner.invoked("systemctl"));
    }
}
