//! External command execution
//!
//! All mutations of the account and group databases go through the
//! [`CommandRunner`] trait so the lifecycle code can be tested with a fake
//! executor that records exact invocations and simulates failures.

use crate::{Error, Result};
use std::io::Write;
use std::process::{Command, Output, Stdio};

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Map a non-zero exit into an error carrying the command context.
    pub fn expect_success(self, cmd: &str) -> Result<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::CommandFailed {
                cmd: cmd.to_string(),
                code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Abstraction over blocking subprocess invocation.
///
/// Inputs are program + arguments + optional stdin; output is the exit status
/// and captured stdout/stderr. No timeout: a hung external command blocks the
/// calling operation (single-admin, non-concurrent invocation is assumed).
pub trait CommandRunner {
    /// Run a command and capture output.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a command, feeding `stdin` to the child before waiting.
    fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &str) -> Result<CommandOutput>;
}

/// Runner backed by `std::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn spawn_error(program: &str, args: &[&str], e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::CommandNotFound(program.to_string())
        } else {
            Error::Command {
                cmd: format!("{} {}", program, args.join(" ")),
                message: e.to_string(),
            }
        }
    }

    fn parse_output(output: Output) -> CommandOutput {
        CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Self::spawn_error(program, args, e))?;
        Ok(Self::parse_output(output))
    }

    fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &str) -> Result<CommandOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Self::spawn_error(program, args, e))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes())?;
        }

        let output = child.wait_with_output().map_err(|e| Error::Command {
            cmd: format!("{} {}", program, args.join(" ")),
            message: e.to_string(),
        })?;
        Ok(Self::parse_output(output))
    }
}
