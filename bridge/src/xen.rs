//! Hypervisor bridge abstraction and the command-backed Xen implementation.

use std::future::Future;
use std::time::Duration;

use tracing::{error, info};

use crate::command::ExternalCommand;
use crate::error::Result;
use crate::protocol::{RawResponse, VmCommand};

/// Issues VM commands against a hypervisor host.
pub trait HypervisorBridge: Send + Sync + 'static {
    /// Run `command` on `target_host` and return whatever the API printed.
    fn invoke(
        &self,
        target_host: &str,
        command: &VmCommand,
    ) -> impl Future<Output = Result<RawResponse>> + Send;
}

/// Bridge that shells out to the VM API executable.
///
/// The final argv is `[vm_api_command.., target_host, command, json]`.
#[derive(Debug, Clone)]
pub struct XenBridge {
    command: ExternalCommand,
}

impl XenBridge {
    pub fn new(command: ExternalCommand) -> Self {
        Self { command }
    }

    /// Build from a configured argv, applying `timeout` to every call.
    pub fn from_argv(argv: &[String], timeout: Duration) -> Option<Self> {
        ExternalCommand::from_argv(argv).map(|command| Self::new(command.with_timeout(timeout)))
    }
}

impl HypervisorBridge for XenBridge {
    async fn invoke(&self, target_host: &str, command: &VmCommand) -> Result<RawResponse> {
        let params = command.params_json()?;
        let extra = vec![target_host.to_string(), command.name().to_string(), params];

        info!(
            host = %target_host,
            command = command.name(),
            request = %self.command.describe(&extra),
            "VM API request"
        );

        match self.command.run(&extra, None).await {
            Ok(output) => {
                info!(
                    host = %target_host,
                    command = command.name(),
                    response = %output.stdout,
                    "VM API response"
                );
                Ok(RawResponse::new(output.stdout))
            }
            Err(e) => {
                error!(
                    host = %target_host,
                    command = command.name(),
                    request = %self.command.describe(&extra),
                    error = %e,
                    "VM API request failed"
                );
                Err(e)
            }
        }
    }
}
