//! SSH Tunnel User Manager Core Library
//!
//! This crate provisions restricted OS accounts that can authenticate over
//! SSH but cannot obtain a shell, schedule jobs, or open anything beyond
//! local/SOCKS port forwards. The account and group databases plus a handful
//! of config files are the only state; every operation re-derives the current
//! picture by live queries instead of trusting a persisted model.

pub mod config;
pub mod credentials;
pub mod error;
pub mod exec;
pub mod fail2ban;
pub mod identity;
pub mod lifecycle;
pub mod model;
pub mod sshd;
pub mod teardown;

pub use config::{Settings, SystemPaths, CONFIG_VERSION};
pub use credentials::{generate_password, validate_public_key, CredentialSetter};
pub use error::{Error, Result};
pub use exec::{CommandOutput, CommandRunner, SystemRunner};
pub use fail2ban::Fail2banManager;
pub use identity::IdentityStore;
pub use lifecycle::UserManager;
pub use model::*;
pub use sshd::SshdConfigurator;
pub use teardown::TeardownCoordinator;
