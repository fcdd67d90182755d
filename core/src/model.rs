//! Domain model types for tunnel users

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default group encoding password authentication.
pub const GROUP_PASSWORD_AUTH: &str = "sshtunnel-password";

/// Default group encoding key authentication.
pub const GROUP_KEY_AUTH: &str = "sshtunnel-key";

/// Authentication mode for a tunnel user.
///
/// The mode is never stored anywhere; it is derived from which of the two
/// tunnel groups the account belongs to (primary or supplementary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Password,
    Key,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Password => "password",
            AuthMode::Key => "key",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AuthMode::Password => "Password",
            AuthMode::Key => "SSH Key",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tunnel user derived from the OS databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub username: String,
    pub auth_mode: AuthMode,
}

/// Request to create (or adopt) a tunnel user.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub username: String,
    pub auth_mode: AuthMode,
    /// Password for password auth; `None` means auto-generate.
    pub password: Option<String>,
    /// Public key for key auth; required when `auth_mode` is `Key`.
    pub public_key: Option<String>,
}

impl CreateRequest {
    pub fn new(username: impl Into<String>, auth_mode: AuthMode) -> Self {
        Self {
            username: username.into(),
            auth_mode,
            password: None,
            public_key: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_username(&self.username)?;
        if self.auth_mode == AuthMode::Key && self.public_key.is_none() {
            return Err(Error::validation(
                "public key is required for key-based auth",
            ));
        }
        Ok(())
    }
}

/// Result of a create/adopt operation.
///
/// Best-effort steps that failed are reported in `warnings` rather than
/// aborting the operation.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub username: String,
    pub auth_mode: AuthMode,
    /// Set when a password was auto-generated. Displayed to the operator
    /// exactly once and never persisted.
    pub generated_password: Option<String>,
    /// False when an existing account was adopted instead of created.
    pub created: bool,
    pub warnings: Vec<String>,
}

/// Report from a bulk teardown operation.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub deleted_users: Vec<String>,
    pub warnings: Vec<String>,
}

/// Validates a username according to the portable POSIX rules useradd
/// enforces
pub fn validate_username(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("username cannot be empty"));
    }

    let re = regex::Regex::new(r"^[a-z_][a-z0-9_-]*$").unwrap();
    if !re.is_match(name) {
        return Err(Error::validation(
            "username must start with a lowercase letter or underscore and contain only lowercase letters, numbers, underscores, and hyphens",
        ));
    }

    if name.len() > 32 {
        return Err(Error::validation("username must be 32 characters or less"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_mode_strings() {
        assert_eq!(AuthMode::Password.as_str(), "password");
        assert_eq!(AuthMode::Key.as_str(), "key");
        assert_eq!(format!("{}", AuthMode::Key), "key");
    }

    #[test]
    fn test_validate_username() {
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("_svc-tunnel1").is_ok());
        assert!(validate_username("").is_err());
        assert!(validate_username("Alice").is_err());
        assert!(validate_username("1alice").is_err());
        assert!(validate_username("al ice").is_err());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn test_create_request_requires_key_for_key_auth() {
        let req = CreateRequest::new("alice", AuthMode::Key);
        assert!(req.validate().is_err());

        let req = req.with_public_key("ssh-ed25519 AAAA");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_create_request_password_optional() {
        // No password means one will be generated downstream.
        let req = CreateRequest::new("bob", AuthMode::Password);
        assert!(req.validate().is_ok());
    }
}
