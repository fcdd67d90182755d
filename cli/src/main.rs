//! sshtun-user - manage SSH tunnel-only users
//!
//! Thin frontend over `sshtun-core`: argument parsing, privilege check, and
//! presentation. All state decisions live in the core crate.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sshtun_core::{
    AuthMode, CreateRequest, Error, Fail2banManager, IdentityStore, Settings, SshdConfigurator,
    SystemRunner, TeardownCoordinator, UserManager,
};
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sshtun-user")]
#[command(author, version, about = "SSH Tunnel User Manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new tunnel user.
    Create {
        /// Username for the new tunnel user.
        username: String,

        /// SSH public key; selects key-based auth.
        #[arg(long, conflicts_with = "password")]
        key: Option<String>,

        /// Password; selects password auth. Pass the flag without a value to
        /// auto-generate one.
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        password: Option<String>,

        /// Skip fail2ban setup.
        #[arg(long)]
        no_fail2ban: bool,
    },

    /// Update an existing tunnel user's credential (and auth mode if it changes).
    Update {
        /// Username of the tunnel user to update.
        username: String,

        /// New SSH public key; switches the user to key auth if needed.
        #[arg(long, conflicts_with = "password")]
        key: Option<String>,

        /// New password; switches to password auth if needed. Pass the flag
        /// without a value to auto-generate one.
        #[arg(long, num_args = 0..=1, default_missing_value = "")]
        password: Option<String>,
    },

    /// List all tunnel users.
    List,

    /// Delete a tunnel user and its artifacts.
    Delete {
        username: String,

        /// Skip the confirmation prompt.
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Apply sshd hardening configuration (and fail2ban).
    Configure {
        /// Skip fail2ban setup.
        #[arg(long)]
        no_fail2ban: bool,
    },

    /// Uninstall components.
    Uninstall {
        target: UninstallTarget,

        /// Skip the confirmation prompt.
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum UninstallTarget {
    /// Delete all tunnel users.
    Users,
    /// Remove groups and hardening config (users must be gone first).
    Config,
    /// Complete uninstall: users, then configuration.
    All,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    require_root()?;
    let settings = Settings::load_or_default().context("loading settings")?;
    let runner = SystemRunner::new();

    match cli.command {
        Commands::Create {
            username,
            key,
            password,
            no_fail2ban,
        } => cmd_create(&runner, &settings, &username, key, password, no_fail2ban),
        Commands::Update {
            username,
            key,
            password,
        } => cmd_update(&runner, &settings, &username, key, password),
        Commands::List => cmd_list(&settings),
        Commands::Delete { username, yes } => cmd_delete(&runner, &settings, &username, yes),
        Commands::Configure { no_fail2ban } => cmd_configure(&runner, &settings, no_fail2ban),
        Commands::Uninstall { target, yes } => cmd_uninstall(&runner, &settings, target, yes),
    }
}

fn require_root() -> Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("this command must be run as root");
    }
    Ok(())
}

fn cmd_create(
    runner: &SystemRunner,
    settings: &Settings,
    username: &str,
    key: Option<String>,
    password: Option<String>,
    no_fail2ban: bool,
) -> Result<()> {
    let identity = IdentityStore::new(settings.clone());
    if identity.user_exists(username) {
        // adoption of an existing account is deliberate only; use `update`
        return Err(Error::AlreadyExists(format!("user '{}' already exists", username)).into());
    }

    let request = match (&key, &password) {
        (Some(k), _) => CreateRequest::new(username, AuthMode::Key).with_public_key(k.trim()),
        (None, Some(p)) => CreateRequest::new(username, AuthMode::Password).with_password(p.clone()),
        (None, None) => bail!("pass --key <PUBKEY> or --password [PW] to pick an auth mode"),
    };

    let sshd = SshdConfigurator::new(runner, settings.clone());
    if !sshd.is_configured() {
        println!("Applying sshd hardening configuration...");
        sshd.configure().context("configuring sshd")?;
        setup_fail2ban(runner, settings, no_fail2ban);
    }

    let manager = UserManager::new(runner, settings.clone());
    let outcome = manager.create(&request)?;

    for warning in &outcome.warnings {
        eprintln!("Warning: {}", warning);
    }

    if outcome.auth_mode == AuthMode::Key {
        if let Err(e) = sshd.add_authorized_keys_directive() {
            eprintln!("Warning: could not add AuthorizedKeysFile directive: {}", e);
        }
    }

    println!(
        "User '{}' created ({} auth)",
        outcome.username,
        outcome.auth_mode.display_name()
    );
    if let Some(generated) = &outcome.generated_password {
        println!();
        println!("Generated password (save it now, it is not stored anywhere):");
        println!("  {}", generated);
    }
    print_client_usage(username, outcome.auth_mode);
    Ok(())
}

fn cmd_update(
    runner: &SystemRunner,
    settings: &Settings,
    username: &str,
    key: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let identity = IdentityStore::new(settings.clone());
    let current_mode = identity.auth_mode(username)?;
    let manager = UserManager::new(runner, settings.clone());
    let credentials = sshtun_core::CredentialSetter::new(runner, settings.paths.clone());

    match (key, password) {
        (Some(k), _) => {
            credentials.setup_ssh_key(username, k.trim())?;
            if current_mode != AuthMode::Key {
                manager.switch_auth_mode(username, AuthMode::Key)?;
                println!("Switched '{}' from {} to key authentication", username, current_mode);
            }
            let sshd = SshdConfigurator::new(runner, settings.clone());
            if let Err(e) = sshd.add_authorized_keys_directive() {
                eprintln!("Warning: could not add AuthorizedKeysFile directive: {}", e);
            }
            println!("SSH key updated for '{}'", username);
            print_client_usage(username, AuthMode::Key);
        }
        (None, Some(p)) => {
            let (password, generated) = if p.is_empty() {
                (sshtun_core::generate_password(), true)
            } else {
                (p, false)
            };
            credentials.set_password(username, &password)?;
            if current_mode != AuthMode::Password {
                manager.switch_auth_mode(username, AuthMode::Password)?;
                println!(
                    "Switched '{}' from {} to password authentication",
                    username, current_mode
                );
            }
            println!("Password updated for '{}'", username);
            if generated {
                println!();
                println!("Generated password (save it now, it is not stored anywhere):");
                println!("  {}", password);
            }
            print_client_usage(username, AuthMode::Password);
        }
        (None, None) => bail!("pass --key <PUBKEY> or --password [PW] to pick what to update"),
    }
    Ok(())
}

fn cmd_list(settings: &Settings) -> Result<()> {
    let identity = IdentityStore::new(settings.clone());
    let users = identity.list()?;

    if users.is_empty() {
        println!("No tunnel users found.");
        return Ok(());
    }

    println!("Tunnel users:");
    for user in users {
        println!("  {} ({} auth)", user.username, user.auth_mode);
    }
    Ok(())
}

fn cmd_delete(runner: &SystemRunner, settings: &Settings, username: &str, yes: bool) -> Result<()> {
    let identity = IdentityStore::new(settings.clone());
    let mode = identity.auth_mode(username)?;

    if !yes && !confirm(&format!("Delete tunnel user '{}' ({} auth)?", username, mode))? {
        println!("Cancelled");
        return Ok(());
    }

    let manager = UserManager::new(runner, settings.clone());
    manager.delete(username)?;
    println!("User '{}' deleted", username);
    Ok(())
}

fn cmd_configure(runner: &SystemRunner, settings: &Settings, no_fail2ban: bool) -> Result<()> {
    let sshd = SshdConfigurator::new(runner, settings.clone());
    sshd.configure().context("configuring sshd")?;
    println!("sshd hardening applied");
    setup_fail2ban(runner, settings, no_fail2ban);
    Ok(())
}

fn cmd_uninstall(
    runner: &SystemRunner,
    settings: &Settings,
    target: UninstallTarget,
    yes: bool,
) -> Result<()> {
    let coordinator = TeardownCoordinator::new(runner, settings.clone());

    let prompt = match target {
        UninstallTarget::Users => "Delete ALL tunnel users?",
        UninstallTarget::Config => "Remove tunnel groups and sshd hardening configuration?",
        UninstallTarget::All => "Delete all tunnel users AND remove all configuration?",
    };
    if !yes && !confirm(prompt)? {
        println!("Cancelled");
        return Ok(());
    }

    let report = match target {
        UninstallTarget::Users => coordinator.uninstall_users(),
        UninstallTarget::Config => coordinator.uninstall_config(),
        UninstallTarget::All => coordinator.uninstall_all(),
    };

    match report {
        Ok(report) => {
            for username in &report.deleted_users {
                println!("  Deleted: {}", username);
            }
            for warning in &report.warnings {
                eprintln!("Warning: {}", warning);
            }
            println!("Uninstall complete.");
            Ok(())
        }
        Err(Error::Partial { deleted, failures }) => {
            for username in &deleted {
                println!("  Deleted: {}", username);
            }
            Err(anyhow!(
                "some users could not be deleted: {}",
                failures.join("; ")
            ))
        }
        Err(e) => Err(e.into()),
    }
}

/// Best-effort: a broken fail2ban never blocks provisioning.
fn setup_fail2ban(runner: &SystemRunner, settings: &Settings, no_fail2ban: bool) {
    if no_fail2ban {
        return;
    }
    let fail2ban = Fail2banManager::new(runner, settings.paths.clone());
    if !fail2ban.is_installed() {
        eprintln!("Warning: fail2ban is not installed; skipping jail setup");
        return;
    }
    match fail2ban.setup() {
        Ok(()) => println!("fail2ban jail configured"),
        Err(e) => eprintln!("Warning: fail2ban setup failed: {}", e),
    }
}

fn print_client_usage(username: &str, mode: AuthMode) {
    println!();
    println!("Client usage (SOCKS proxy on local port 1080):");
    match mode {
        AuthMode::Password => println!("  ssh -N -D 1080 {}@<server>", username),
        AuthMode::Key => println!("  ssh -N -D 1080 -i <keyfile> {}@<server>", username),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
