//! Live queries against the OS account and group databases
//!
//! Nothing here is cached: every call re-parses the passwd/group files so the
//! answer reflects whatever an external mutation (ours or somebody else's)
//! left behind. Group membership is the sole encoding of a tunnel user's auth
//! mode, counting both primary and supplementary membership.

use crate::{AuthMode, Error, Result, Settings, UserInfo};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Read-only view over the account and group databases.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    settings: Settings,
}

impl IdentityStore {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// True iff the username has an entry in the account database.
    pub fn user_exists(&self, username: &str) -> bool {
        read_lines_tolerant(&self.settings.paths.passwd_file)
            .iter()
            .any(|line| passwd_field(line, 0) == Some(username))
    }

    /// True iff the group has an entry in the group database.
    pub fn group_exists(&self, group: &str) -> bool {
        self.group_entry(group).is_some()
    }

    /// Supplementary members of a group. A missing group (or group file) is
    /// an empty set, not an error.
    pub fn group_members(&self, group: &str) -> Vec<String> {
        match self.group_entry(group) {
            Some(entry) => entry.members,
            None => Vec::new(),
        }
    }

    /// Users whose primary GID matches the group's GID.
    pub fn users_with_primary_group(&self, group: &str) -> Vec<String> {
        let Some(entry) = self.group_entry(group) else {
            return Vec::new();
        };

        read_lines_tolerant(&self.settings.paths.passwd_file)
            .iter()
            .filter(|line| passwd_field(line, 3) == Some(entry.gid.as_str()))
            .filter_map(|line| passwd_field(line, 0).map(str::to_string))
            .collect()
    }

    /// Membership by either kind: supplementary list or primary GID.
    pub fn in_group(&self, username: &str, group: &str) -> bool {
        let Some(entry) = self.group_entry(group) else {
            return false;
        };

        if entry.members.iter().any(|m| m == username) {
            return true;
        }

        self.has_primary_group(username, group)
    }

    /// True iff the group is the user's primary group. Distinguished from
    /// supplementary membership because `gpasswd -d` cannot remove a primary
    /// membership; moving it takes `usermod -g`.
    pub fn has_primary_group(&self, username: &str, group: &str) -> bool {
        let Some(entry) = self.group_entry(group) else {
            return false;
        };

        self.user_primary_gid(username)
            .map(|gid| gid == entry.gid)
            .unwrap_or(false)
    }

    /// Derive the auth mode from group membership.
    ///
    /// The password group is checked first; if the account is somehow in both
    /// groups (an invariant violation the switch sequencing should make
    /// unreachable) the password mode wins and the inconsistency is logged.
    pub fn auth_mode(&self, username: &str) -> Result<AuthMode> {
        let in_password = self.in_group(username, &self.settings.password_group);
        let in_key = self.in_group(username, &self.settings.key_group);

        if in_password && in_key {
            warn!(
                user = username,
                "account is in both tunnel groups; treating as password auth"
            );
        }

        if in_password {
            Ok(AuthMode::Password)
        } else if in_key {
            Ok(AuthMode::Key)
        } else {
            Err(Error::NotFound(format!(
                "user '{}' is not a tunnel user",
                username
            )))
        }
    }

    pub fn is_tunnel_user(&self, username: &str) -> bool {
        self.auth_mode(username).is_ok()
    }

    /// All tunnel users, de-duplicated, password-mode entries first.
    pub fn list(&self) -> Result<Vec<UserInfo>> {
        let mut users = Vec::new();
        let mut seen = HashSet::new();

        for (group, mode) in [
            (&self.settings.password_group, AuthMode::Password),
            (&self.settings.key_group, AuthMode::Key),
        ] {
            let mut names = self.group_members(group);
            names.extend(self.users_with_primary_group(group));

            for username in names {
                if seen.insert(username.clone()) {
                    users.push(UserInfo {
                        username,
                        auth_mode: mode,
                    });
                }
            }
        }

        Ok(users)
    }

    /// True iff either tunnel group has at least one member of either kind.
    pub fn groups_have_users(&self) -> bool {
        self.settings.tunnel_groups().iter().any(|group| {
            !self.group_members(group).is_empty()
                || !self.users_with_primary_group(group).is_empty()
        })
    }

    fn group_entry(&self, group: &str) -> Option<GroupEntry> {
        read_lines_tolerant(&self.settings.paths.group_file)
            .iter()
            .find_map(|line| parse_group_line(line, group))
    }

    fn user_primary_gid(&self, username: &str) -> Option<String> {
        read_lines_tolerant(&self.settings.paths.passwd_file)
            .iter()
            .find(|line| passwd_field(line, 0) == Some(username))
            .and_then(|line| passwd_field(line, 3).map(str::to_string))
    }
}

#[derive(Debug)]
struct GroupEntry {
    gid: String,
    members: Vec<String>,
}

/// Parse one `/etc/group` line: `name:password:GID:member,member`.
fn parse_group_line(line: &str, group: &str) -> Option<GroupEntry> {
    let mut fields = line.split(':');
    if fields.next()? != group {
        return None;
    }
    fields.next()?; // password placeholder
    let gid = fields.next()?.to_string();
    let member_list = fields.next().unwrap_or("");

    let members = if member_list.is_empty() {
        Vec::new()
    } else {
        member_list.split(',').map(str::to_string).collect()
    };

    Some(GroupEntry { gid, members })
}

/// Field of an `/etc/passwd` line: `name:password:UID:GID:GECOS:home:shell`.
fn passwd_field(line: &str, index: usize) -> Option<&str> {
    line.split(':').nth(index)
}

/// Lines of a database file; a missing file reads as empty.
fn read_lines_tolerant(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(content) => content.lines().map(str::to_string).collect(),
        Err(_) => Vec::new(),
    }
}
