//! Bulk deletion and uninstall sequencing
//!
//! The coordinator never trusts earlier steps: group deletion re-checks
//! membership through live queries, and the cleanup passes prune artifacts
//! for accounts that no longer exist rather than replaying a log of what was
//! created. Uninstall variants run a fixed sequence: delete users, remove
//! hardening config, delete groups, clean the key directory, clean the
//! deny-lists.

use crate::exec::CommandRunner;
use crate::fail2ban::Fail2banManager;
use crate::sshd::SshdConfigurator;
use crate::{Error, IdentityStore, Result, Settings, TeardownReport, UserManager};
use std::fs;
use tracing::warn;

/// Coordinates bulk teardown across users, groups, and config files.
pub struct TeardownCoordinator<'r> {
    runner: &'r dyn CommandRunner,
    settings: Settings,
    identity: IdentityStore,
}

impl<'r> TeardownCoordinator<'r> {
    pub fn new(runner: &'r dyn CommandRunner, settings: Settings) -> Self {
        let identity = IdentityStore::new(settings.clone());
        Self {
            runner,
            settings,
            identity,
        }
    }

    /// Delete every tunnel user, collecting per-user failures.
    ///
    /// Zero existing users is a successful no-op. Any failure yields
    /// [`Error::Partial`] carrying both the deleted and the failed usernames,
    /// so callers can report precisely what happened.
    pub fn delete_all_users(&self) -> Result<Vec<String>> {
        let users = self.identity.list()?;
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let manager = UserManager::new(self.runner, self.settings.clone());
        let mut deleted = Vec::new();
        let mut failures = Vec::new();

        for user in users {
            match manager.delete(&user.username) {
                Ok(()) => deleted.push(user.username),
                Err(e) => failures.push(format!("{}: {}", user.username, e)),
            }
        }

        if failures.is_empty() {
            Ok(deleted)
        } else {
            Err(Error::Partial { deleted, failures })
        }
    }

    /// Delete both tunnel groups.
    ///
    /// Ordering precondition enforced through a live query: fails while any
    /// member (of either kind) remains. An already-absent group is a no-op.
    pub fn delete_groups(&self) -> Result<()> {
        if self.identity.groups_have_users() {
            return Err(Error::precondition(
                "cannot delete groups: tunnel users still exist; delete users first",
            ));
        }

        for group in self.settings.tunnel_groups() {
            if !self.identity.group_exists(group) {
                continue;
            }
            self.runner
                .run("groupdel", &[group])?
                .expect_success(&format!("groupdel {}", group))?;
        }

        Ok(())
    }

    /// Remove per-user key files whose username no longer exists in the
    /// account database; remove the directory itself only once empty.
    pub fn cleanup_authorized_keys_dir(&self) -> Result<()> {
        let dir = &self.settings.paths.authorized_keys_dir;
        if !dir.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                continue;
            }
            let username = entry.file_name().to_string_lossy().to_string();
            if !self.identity.user_exists(&username) {
                fs::remove_file(entry.path())?;
            }
        }

        if fs::read_dir(dir)?.next().is_none() {
            fs::remove_dir(dir)?;
        }

        Ok(())
    }

    /// Prune deny-list lines whose username no longer exists. Blank lines
    /// and entries for accounts that still exist are preserved in order.
    pub fn cleanup_deny_files(&self) -> Result<()> {
        for path in self.settings.paths.deny_files() {
            if !path.exists() {
                continue;
            }

            let content = fs::read_to_string(path)?;
            let kept: Vec<&str> = content
                .lines()
                .filter(|line| line.is_empty() || self.identity.user_exists(line))
                .collect();

            if kept.len() == content.lines().count() {
                continue;
            }

            let mut updated = kept.join("\n");
            if !updated.is_empty() {
                updated.push('\n');
            }
            fs::write(path, updated)?;
        }
        Ok(())
    }

    /// Delete all tunnel users and clean their artifacts, leaving the
    /// hardening config and groups in place.
    pub fn uninstall_users(&self) -> Result<TeardownReport> {
        let mut report = TeardownReport::default();

        let outcome = self.delete_all_users();
        self.run_cleanups(&mut report);

        match outcome {
            Ok(deleted) => {
                report.deleted_users = deleted;
                Ok(report)
            }
            Err(e) => {
                // the error path drops the report; surface its cleanup
                // warnings here instead of losing them
                for warning in &report.warnings {
                    warn!(warning = %warning, "cleanup issue during partial teardown");
                }
                Err(e)
            }
        }
    }

    /// Remove groups and config; requires all tunnel users to be gone first.
    pub fn uninstall_config(&self) -> Result<TeardownReport> {
        if self.identity.groups_have_users() {
            return Err(Error::precondition(
                "cannot remove configuration: tunnel users still exist; delete users first",
            ));
        }

        let mut report = TeardownReport::default();

        SshdConfigurator::new(self.runner, self.settings.clone()).remove_and_reload()?;

        if let Err(e) = Fail2banManager::new(self.runner, self.settings.paths.clone()).remove() {
            warn!(error = %e, "could not remove fail2ban jail");
            report.warnings.push(format!("fail2ban jail: {}", e));
        }

        self.delete_groups()?;
        self.run_cleanups(&mut report);

        Ok(report)
    }

    /// Complete teardown. Per-user failures and best-effort cleanup errors
    /// become warnings so the remaining steps still run.
    pub fn uninstall_all(&self) -> Result<TeardownReport> {
        let mut report = TeardownReport::default();

        match self.delete_all_users() {
            Ok(deleted) => report.deleted_users = deleted,
            Err(Error::Partial { deleted, failures }) => {
                report.deleted_users = deleted;
                report.warnings.extend(failures);
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = SshdConfigurator::new(self.runner, self.settings.clone()).remove_and_reload()
        {
            warn!(error = %e, "could not remove sshd hardening");
            report.warnings.push(format!("sshd config: {}", e));
        }

        if let Err(e) = Fail2banManager::new(self.runner, self.settings.paths.clone()).remove() {
            warn!(error = %e, "could not remove fail2ban jail");
            report.warnings.push(format!("fail2ban jail: {}", e));
        }

        if let Err(e) = self.delete_groups() {
            warn!(error = %e, "could not delete tunnel groups");
            report.warnings.push(format!("groups: {}", e));
        }

        self.run_cleanups(&mut report);

        Ok(report)
    }

    fn run_cleanups(&self, report: &mut TeardownReport) {
        if let Err(e) = self.cleanup_authorized_keys_dir() {
            warn!(error = %e, "authorized keys cleanup failed");
            report.warnings.push(format!("authorized keys dir: {}", e));
        }
        if let Err(e) = self.cleanup_deny_files() {
            warn!(error = %e, "deny-list cleanup failed");
            report.warnings.push(format!("deny files: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::FakeRunner;
    use crate::identity::fixtures::write_databases;
    use tempfile::tempdir;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
alice:x:1001:2001:SSH tunnel only (password):/nonexistent:/usr/sbin/nologin
bob:x:1002:2002:SSH tunnel only (key):/nonexistent:/usr/sbin/nologin
";

    const GROUP: &str = "\
root:x:0:
sshtunnel-password:x:2001:
sshtunnel-key:x:2002:
";

    #[test]
    fn test_delete_all_users_empty_is_noop() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), "root:x:0:0::/root:/bin/bash\n", GROUP);
        let runner = FakeRunner::new();
        let coordinator = TeardownCoordinator::new(&runner, settings);

        let deleted = coordinator.delete_all_users().unwrap();
        assert!(deleted.is_empty());
        assert!(!runner.invoked("userdel"));
    }

    #[test]
    fn test_delete_all_users_deletes_everyone() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), PASSWD, GROUP);
        let runner = FakeRunner::new();
        let coordinator = TeardownCoordinator::new(&runner, settings);

        let deleted = coordinator.delete_all_users().unwrap();
        assert_eq!(deleted, vec!["alice", "bob"]);
        assert_eq!(runner.calls_for("userdel").len(), 2);
    }

    #[test]
    fn test_delete_all_users_partial_failure_keeps_success_list() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), PASSWD, GROUP);
        let runner = FakeRunner::new();
        runner.fail_when("userdel", "bob", "user bob is currently logged in");
        let coordinator = TeardownCoordinator::new(&runner, settings);

        match coordinator.delete_all_users() {
            Err(Error::Partial { deleted, failures }) => {
                assert_eq!(deleted, vec!["alice"]);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("bob:"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_delete_groups_precondition() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), PASSWD, GROUP);
        let runner = FakeRunner::new();
        let coordinator = TeardownCoordinator::new(&runner, settings.clone());

        // alice and bob still have tunnel groups as primary GID
        assert!(matches!(
            coordinator.delete_groups(),
            Err(Error::Precondition(_))
        ));
        assert!(!runner.invoked("groupdel"));

        // once the accounts are gone the groups can be deleted
        fs::write(&settings.paths.passwd_file, "root:x:0:0::/root:/bin/bash\n").unwrap();
        coordinator.delete_groups().unwrap();
        assert_eq!(runner.calls_for("groupdel").len(), 2);
    }

    #[test]
    fn test_delete_groups_skips_absent_group() {
        let dir = tempdir().unwrap();
        let settings = write_databases(
            dir.path(),
            "root:x:0:0::/root:/bin/bash\n",
            "sshtunnel-password:x:2001:\n",
        );
        let runner = FakeRunner::new();
        let coordinator = TeardownCoordinator::new(&runner, settings);

        coordinator.delete_groups().unwrap();
        let calls = runner.calls_for("groupdel");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].has_arg("sshtunnel-password"));
    }

    #[test]
    fn test_cleanup_authorized_keys_dir_removes_orphans_only() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), PASSWD, GROUP);
        let keys_dir = settings.paths.authorized_keys_dir.clone();
        fs::create_dir_all(&keys_dir).unwrap();
        fs::write(keys_dir.join("alice"), "restrict,port-forwarding k\n").unwrap();
        fs::write(keys_dir.join("ghost"), "restrict,port-forwarding k\n").unwrap();

        let runner = FakeRunner::new();
        let coordinator = TeardownCoordinator::new(&runner, settings);
        coordinator.cleanup_authorized_keys_dir().unwrap();

        assert!(keys_dir.join("alice").exists());
        assert!(!keys_dir.join("ghost").exists());
        assert!(keys_dir.exists());
    }

    #[test]
    fn test_cleanup_authorized_keys_dir_removes_dir_when_empty() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), PASSWD, GROUP);
        let keys_dir = settings.paths.authorized_keys_dir.clone();
        fs::create_dir_all(&keys_dir).unwrap();
        fs::write(keys_dir.join("ghost"), "k\n").unwrap();

        let runner = FakeRunner::new();
        let coordinator = TeardownCoordinator::new(&runner, settings);
        coordinator.cleanup_authorized_keys_dir().unwrap();

        assert!(!keys_dir.exists());
    }

    #[test]
    fn test_cleanup_deny_files_prunes_only_missing_users() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), PASSWD, GROUP);
        fs::write(&settings.paths.cron_deny_file, "alice\nghost\nbob\n").unwrap();
        fs::write(&settings.paths.at_deny_file, "ghost\n\nalice\n").unwrap();

        let runner = FakeRunner::new();
        let coordinator = TeardownCoordinator::new(&runner, settings.clone());
        coordinator.cleanup_deny_files().unwrap();

        assert_eq!(
            fs::read_to_string(&settings.paths.cron_deny_file).unwrap(),
            "alice\nbob\n"
        );
        // blank lines survive the rewrite
        assert_eq!(
            fs::read_to_string(&settings.paths.at_deny_file).unwrap(),
            "\nalice\n"
        );
    }

    #[test]
    fn test_uninstall_users_partial_failure_still_runs_cleanups() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), PASSWD, GROUP);
        let keys_dir = settings.paths.authorized_keys_dir.clone();
        fs::create_dir_all(&keys_dir).unwrap();
        fs::write(keys_dir.join("ghost"), "k\n").unwrap();
        // a directory where a deny file belongs makes that cleanup warn
        fs::create_dir_all(&settings.paths.cron_deny_file).unwrap();

        let runner = FakeRunner::new();
        runner.fail_when("userdel", "bob", "user bob is currently logged in");
        let coordinator = TeardownCoordinator::new(&runner, settings.clone());

        match coordinator.uninstall_users() {
            Err(Error::Partial { deleted, failures }) => {
                assert_eq!(deleted, vec!["alice"]);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("bob:"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        // cleanups ran before the error was surfaced
        assert!(!keys_dir.join("ghost").exists());
    }

    #[test]
    fn test_uninstall_all_runs_full_sequence() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), PASSWD, GROUP);

        // seed hardening config, jail, key file, deny entries
        let runner = FakeRunner::new();
        SshdConfigurator::new(&runner, settings.clone())
            .configure()
            .unwrap();
        Fail2banManager::new(&runner, settings.paths.clone())
            .setup()
            .unwrap();
        fs::create_dir_all(&settings.paths.authorized_keys_dir).unwrap();
        fs::write(settings.paths.authorized_keys_dir.join("bob"), "k\n").unwrap();
        fs::write(&settings.paths.cron_deny_file, "alice\nbob\n").unwrap();

        let coordinator = TeardownCoordinator::new(&runner, settings.clone());
        let report = coordinator.uninstall_all().unwrap();

        assert_eq!(report.deleted_users, vec!["alice", "bob"]);
        // delete_groups still sees alice/bob in passwd (fake runner does not
        // mutate the databases), so it degrades to a warning
        assert!(report.warnings.iter().any(|w| w.starts_with("groups:")));

        assert!(!settings
            .paths
            .sshd_config_dir
            .join("60-sshtun-hardening.conf")
            .exists());
        assert!(!settings.paths.fail2ban_jail_file.exists());
    }

    #[test]
    fn test_uninstall_config_requires_empty_groups() {
        let dir = tempdir().unwrap();
        let settings = write_databases(dir.path(), PASSWD, GROUP);
        let runner = FakeRunner::new();
        let coordinator = TeardownCoordinator::new(&runner, settings);

        assert!(matches!(
            coordinator.uninstall_config(),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_uninstall_config_removes_everything_once_empty() {
        let dir = tempdir().unwrap();
        let settings =
            write_databases(dir.path(), "root:x:0:0::/root:/bin/bash\n", GROUP);
        let runner = FakeRunner::new();
        SshdConfigurator::new(&runner, settings.clone())
            .configure()
            .unwrap();

        let coordinator = TeardownCoordinator::new(&runner, settings.clone());
        let report = coordinator.uninstall_config().unwrap();

        assert!(report.deleted_users.is_empty());
        assert!(!settings
            .paths
            .sshd_config_dir
            .join("60-sshtun-hardening.conf")
            .exists());
        assert_eq!(runner.calls_for("groupdel").len(), 2);
    }
}
