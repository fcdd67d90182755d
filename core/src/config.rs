//! Configuration for system paths and tunnel group names
//!
//! Everything the engine touches on disk is addressed through [`SystemPaths`]
//! so tests can point the whole stack at a temporary directory. The settings
//! are an explicit value passed into every manager; there are no process-wide
//! mutables.

use crate::{Error, Result, GROUP_KEY_AUTH, GROUP_PASSWORD_AUTH};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current config version for migration support
pub const CONFIG_VERSION: u32 = 1;

/// Locations of the OS databases and the config files the engine maintains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPaths {
    /// Account database (read-only parsing).
    pub passwd_file: PathBuf,
    /// Group database (read-only parsing).
    pub group_file: PathBuf,
    /// Drop-in directory merged into the sshd configuration.
    pub sshd_config_dir: PathBuf,
    /// Per-user restricted key files, one file per key-mode user.
    pub authorized_keys_dir: PathBuf,
    /// Usernames listed here are barred from cron.
    pub cron_deny_file: PathBuf,
    /// Usernames listed here are barred from at.
    pub at_deny_file: PathBuf,
    /// fail2ban jail drop-in.
    pub fail2ban_jail_file: PathBuf,
}

impl Default for SystemPaths {
    fn default() -> Self {
        Self {
            passwd_file: PathBuf::from("/etc/passwd"),
            group_file: PathBuf::from("/etc/group"),
            sshd_config_dir: PathBuf::from("/etc/ssh/sshd_config.d"),
            authorized_keys_dir: PathBuf::from("/etc/ssh/authorized_keys.d"),
            cron_deny_file: PathBuf::from("/etc/cron.deny"),
            at_deny_file: PathBuf::from("/etc/at.deny"),
            fail2ban_jail_file: PathBuf::from("/etc/fail2ban/jail.d/sshtun.local"),
        }
    }
}

impl SystemPaths {
    /// Both scheduler deny-lists.
    pub fn deny_files(&self) -> [&Path; 2] {
        [&self.cron_deny_file, &self.at_deny_file]
    }

    /// Re-root every path under `root`. Used by tests to run the full stack
    /// against a scratch directory.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            passwd_file: root.join("passwd"),
            group_file: root.join("group"),
            sshd_config_dir: root.join("ssh/sshd_config.d"),
            authorized_keys_dir: root.join("ssh/authorized_keys.d"),
            cron_deny_file: root.join("cron.deny"),
            at_deny_file: root.join("at.deny"),
            fail2ban_jail_file: root.join("fail2ban/jail.d/sshtun.local"),
        }
    }
}

/// Engine settings: tunnel group names plus system paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub version: u32,
    /// Group whose membership encodes password auth.
    pub password_group: String,
    /// Group whose membership encodes key auth.
    pub key_group: String,
    pub paths: SystemPaths,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            password_group: GROUP_PASSWORD_AUTH.to_string(),
            key_group: GROUP_KEY_AUTH.to_string(),
            paths: SystemPaths::default(),
        }
    }
}

impl Settings {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/sshtun-user/config.toml")
    }

    /// Load settings from file, or use defaults if not present
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load settings from a specific path
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Both tunnel groups, password group first.
    pub fn tunnel_groups(&self) -> [&str; 2] {
        [&self.password_group, &self.key_group]
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.password_group.is_empty() || self.key_group.is_empty() {
            return Err(Error::config("tunnel group names cannot be empty"));
        }
        if self.password_group == self.key_group {
            return Err(Error::config(
                "password and key groups must be distinct; membership is the sole encoding of auth mode",
            ));
        }
        Ok(())
    }

    /// Settings rooted at a scratch directory, for tests.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            paths: SystemPaths::rooted_at(root),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert_eq!(settings.version, CONFIG_VERSION);
        assert_eq!(settings.password_group, "sshtunnel-password");
        assert_eq!(settings.key_group, "sshtunnel-key");
        assert_eq!(settings.paths.passwd_file, PathBuf::from("/etc/passwd"));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let settings = Settings::default();
        settings.save_to(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.version, settings.version);
        assert_eq!(loaded.key_group, settings.key_group);
        assert_eq!(loaded.paths.at_deny_file, settings.paths.at_deny_file);
    }

    #[test]
    fn test_settings_rejects_identical_groups() {
        let settings = Settings {
            key_group: GROUP_PASSWORD_AUTH.to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rooted_paths() {
        let dir = tempdir().unwrap();
        let paths = SystemPaths::rooted_at(dir.path());
        assert!(paths.passwd_file.starts_with(dir.path()));
        assert!(paths.fail2ban_jail_file.starts_with(dir.path()));
        assert_eq!(paths.deny_files().len(), 2);
    }
}
