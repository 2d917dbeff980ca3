//! External command runner
//!
//! Every collaborator outside this process (the VM API, the name registrar,
//! the configuration run, backup reports, mail) is reached by running an
//! executable. `ExternalCommand` holds the fixed argv prefix from
//! configuration and runs it with per-call arguments and optional stdin.

use std::process::Stdio;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

use crate::error::{Error, Result};

/// What a successful run printed.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout followed by stderr, the way operators expect to read a failure.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Decode stdout as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.stdout).map_err(|source| Error::MalformedResponse {
            raw: self.stdout.clone(),
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ExternalCommand {
    /// Build from a configured argv such as `["userv", "mws-admin", "mws_vm_api"]`.
    ///
    /// Returns `None` for an empty argv.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: None,
        })
    }

    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The full argv for a call with `extra` appended, for logging.
    pub fn describe(&self, extra: &[String]) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .chain(extra.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run with `extra` arguments appended and wait for the process to exit.
    ///
    /// A non-zero exit is an [`Error::Failure`] carrying stdout and stderr.
    pub async fn run(&self, extra: &[String], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(extra)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        debug!(command = %self.describe(extra), "Running external command");

        let mut child = command.spawn()?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input).await?;
                // Dropping the pipe closes it so the child sees EOF
            }
        }

        let output = match self.timeout {
            Some(after) => tokio::time::timeout(after, child.wait_with_output())
                .await
                .map_err(|_| Error::Timeout {
                    program: self.program.clone(),
                    after,
                })??,
            None => child.wait_with_output().await?,
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            return Err(Error::Failure {
                program: self.program.clone(),
                exit_code: output.status.code(),
                output: result.combined(),
            });
        }

        Ok(result)
    }
}
