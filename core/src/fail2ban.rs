//! fail2ban jail for the sshd brute-force surface
//!
//! Independent lifecycle from the rest of the hardening set. Callers treat
//! every failure here as a warning; a missing or broken fail2ban must never
//! abort user provisioning.

use crate::exec::CommandRunner;
use crate::{Result, SystemPaths};
use std::fs;
use tracing::info;

const JAIL_CONTENT: &str = r#"# Managed by sshtun-user.
[sshd]
enabled = true
maxretry = 3
findtime = 10m
bantime = 1h
"#;

/// Writes and removes the intrusion-ban jail file.
pub struct Fail2banManager<'r> {
    runner: &'r dyn CommandRunner,
    paths: SystemPaths,
}

impl<'r> Fail2banManager<'r> {
    pub fn new(runner: &'r dyn CommandRunner, paths: SystemPaths) -> Self {
        Self { runner, paths }
    }

    /// True iff a fail2ban client binary is on the PATH.
    pub fn is_installed(&self) -> bool {
        self.runner
            .run("which", &["fail2ban-client"])
            .map(|out| out.success())
            .unwrap_or(false)
    }

    /// Write the jail file and restart the service.
    pub fn setup(&self) -> Result<()> {
        if let Some(parent) = self.paths.fail2ban_jail_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.paths.fail2ban_jail_file, JAIL_CONTENT)?;

        self.runner
            .run("systemctl", &["restart", "fail2ban"])?
            .expect_success("systemctl restart fail2ban")?;

        info!("fail2ban jail configured");
        Ok(())
    }

    /// Remove the jail file and reload; a no-op when the file is absent.
    pub fn remove(&self) -> Result<()> {
        if !self.paths.fail2ban_jail_file.exists() {
            return Ok(());
        }

        fs::remove_file(&self.paths.fail2ban_jail_file)?;
        self.runner
            .run("systemctl", &["reload", "fail2ban"])?
            .expect_success("systemctl reload fail2ban")?;
        Ok(())
    }
}
