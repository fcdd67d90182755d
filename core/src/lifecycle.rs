//! Tunnel user lifecycle: create, adopt, switch auth mode, delete
//!
//! Every operation re-reads the OS databases before mutating and is a plain
//! sequence of external-command invocations with no rollback: a failure at
//! step N leaves steps 1..N-1 applied. Cosmetic steps (deny-list upkeep)
//! degrade to warnings instead of aborting.

use crate::credentials::{generate_password, CredentialSetter};
use crate::exec::CommandRunner;
use crate::{
    AuthMode, CreateOutcome, CreateRequest, Error, IdentityStore, Result, Settings,
};
use std::fs;
use tracing::{info, warn};

/// Creates, updates, and deletes tunnel users.
pub struct UserManager<'r> {
    runner: &'r dyn CommandRunner,
    settings: Settings,
    identity: IdentityStore,
}

impl<'r> UserManager<'r> {
    pub fn new(runner: &'r dyn CommandRunner, settings: Settings) -> Self {
        let identity = IdentityStore::new(settings.clone());
        Self {
            runner,
            settings,
            identity,
        }
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    /// Create the tunnel groups if they don't exist.
    pub fn ensure_groups(&self) -> Result<()> {
        for group in self.settings.tunnel_groups() {
            if !self.identity.group_exists(group) {
                self.runner
                    .run("groupadd", &["--system", group])?
                    .expect_success(&format!("groupadd {}", group))?;
            }
        }
        Ok(())
    }

    /// Create a tunnel user, or adopt an existing account.
    ///
    /// An account that already exists — tunnel user or not — is stripped of
    /// both tunnel group memberships and added to the target group; its
    /// credential is replaced. The adoption is reported through the outcome's
    /// warnings, not treated as an error.
    pub fn create(&self, request: &CreateRequest) -> Result<CreateOutcome> {
        request.validate()?;
        self.ensure_groups()?;

        let username = request.username.as_str();
        let target_group = self.group_for(request.auth_mode);
        let mut warnings = Vec::new();

        let created = if self.identity.user_exists(username) {
            warnings.push(format!(
                "user '{}' already existed; existing account adopted into tunnel-user status",
                username
            ));
            self.assign_tunnel_group(username, target_group)?;
            false
        } else {
            let comment = format!("SSH tunnel only ({})", request.auth_mode);
            self.runner
                .run(
                    "useradd",
                    &[
                        "--system",
                        "--shell",
                        "/usr/sbin/nologin",
                        "--no-create-home",
                        "--home-dir",
                        "/nonexistent",
                        "--gid",
                        target_group,
                        "--comment",
                        &comment,
                        username,
                    ],
                )?
                .expect_success(&format!("useradd {}", username))?;
            true
        };

        let credentials = CredentialSetter::new(self.runner, self.settings.paths.clone());
        let mut generated_password = None;

        match request.auth_mode {
            AuthMode::Key => {
                let key = request
                    .public_key
                    .as_deref()
                    .ok_or_else(|| Error::validation("public key is required for key-based auth"))?;
                credentials.setup_ssh_key(username, key)?;
            }
            AuthMode::Password => {
                let password = match request.password.as_deref() {
                    Some(p) if !p.is_empty() => p.to_string(),
                    _ => {
                        let p = generate_password();
                        generated_password = Some(p.clone());
                        p
                    }
                };
                credentials.set_password(username, &password)?;
            }
        }

        if let Err(e) = self.add_to_deny_files(username) {
            warn!(user = username, error = %e, "could not update scheduler deny-lists");
            warnings.push(format!("could not update scheduler deny-lists: {}", e));
        }

        info!(user = username, mode = %request.auth_mode, created, "tunnel user configured");

        Ok(CreateOutcome {
            username: username.to_string(),
            auth_mode: request.auth_mode,
            generated_password,
            created,
            warnings,
        })
    }

    /// Move an existing tunnel user to the other auth group.
    ///
    /// Removes membership in both groups, then adds the target, so the user
    /// is never in both. Credentials are not touched; the caller sets the new
    /// credential before or after the switch.
    pub fn switch_auth_mode(&self, username: &str, mode: AuthMode) -> Result<()> {
        if !self.identity.is_tunnel_user(username) {
            return Err(Error::NotFound(format!(
                "user '{}' is not a tunnel user",
                username
            )));
        }

        self.assign_tunnel_group(username, self.group_for(mode))?;

        info!(user = username, mode = %mode, "auth mode switched");
        Ok(())
    }

    /// Delete a tunnel user and its artifacts.
    ///
    /// Group removal and account deletion are both attempted even if earlier
    /// steps fail, so a later list never shows a half-deleted user.
    pub fn delete(&self, username: &str) -> Result<()> {
        if !self.identity.is_tunnel_user(username) {
            return Err(Error::NotFound(format!(
                "user '{}' is not a tunnel user",
                username
            )));
        }

        self.strip_tunnel_groups(username);

        self.runner
            .run("userdel", &[username])?
            .expect_success(&format!("userdel {}", username))?;

        let key_file = self.settings.paths.authorized_keys_dir.join(username);
        if key_file.exists() {
            fs::remove_file(&key_file)?;
        }

        if let Err(e) = self.remove_from_deny_files(username) {
            warn!(user = username, error = %e, "could not prune scheduler deny-lists");
        }

        info!(user = username, "tunnel user deleted");
        Ok(())
    }

    fn group_for(&self, mode: AuthMode) -> &str {
        match mode {
            AuthMode::Password => &self.settings.password_group,
            AuthMode::Key => &self.settings.key_group,
        }
    }

    /// Make `target_group` the user's sole tunnel membership.
    ///
    /// Supplementary membership in both groups is stripped first. Accounts
    /// created here carry a tunnel group as their primary GID, which
    /// `gpasswd -d` cannot remove; those are moved with `usermod -g` so the
    /// old membership never lingers to skew mode derivation.
    fn assign_tunnel_group(&self, username: &str, target_group: &str) -> Result<()> {
        self.strip_tunnel_groups(username);

        let primary_is_tunnel = self
            .settings
            .tunnel_groups()
            .iter()
            .any(|group| self.identity.has_primary_group(username, group));

        let args = if primary_is_tunnel {
            ["-g", target_group, username]
        } else {
            ["-aG", target_group, username]
        };
        self.runner
            .run("usermod", &args)?
            .expect_success(&format!("usermod {} {} {}", args[0], target_group, username))?;
        Ok(())
    }

    /// Drop supplementary membership in both tunnel groups. Failures are
    /// expected when the user is not a member and are ignored.
    fn strip_tunnel_groups(&self, username: &str) {
        for group in self.settings.tunnel_groups() {
            let _ = self.runner.run("gpasswd", &["-d", username, group]);
        }
    }

    /// Add the username to both scheduler deny-lists, creating the files if
    /// missing; already-present entries are left alone.
    fn add_to_deny_files(&self, username: &str) -> Result<()> {
        for path in self.settings.paths.deny_files() {
            let mut content = if path.exists() {
                fs::read_to_string(path)?
            } else {
                String::new()
            };

            if content.lines().any(|line| line == username) {
                continue;
            }

            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(username);
            content.push('\n');
            fs::write(path, content)?;
        }
        Ok(())
    }

    /// Remove exact username lines from both deny-lists; every other line,
    /// blank lines included, is preserved in order.
    fn remove_from_deny_files(&self, username: &str) -> Result<()> {
        for path in self.settings.paths.deny_files() {
            if !path.exists() {
                continue;
            }

            let content = fs::read_to_string(path)?;
            let kept: Vec<&str> = content.lines().filter(|line| *line != username).collect();

            let mut updated = kept.join("\n");
            if !updated.is_empty() {
                updated.push('\n');
            }
            fs::write(path, updated)?;
        }
        Ok(())
    }
}
