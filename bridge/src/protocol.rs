//! Wire types for the hypervisor VM API.
//!
//! Parameters are serialised to a single JSON argument. Responses are free
//! form; only `create` carries data the caller needs (`vmid`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonAction {
    PowerOn,
    PowerOff,
    Reboot,
}

impl ButtonAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ButtonAction::PowerOn => "poweron",
            ButtonAction::PowerOff => "poweroff",
            ButtonAction::Reboot => "reboot",
        }
    }
}

impl std::fmt::Display for ButtonAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(rename = "IPv4")]
    pub ipv4: String,
    #[serde(rename = "IPv6", skip_serializing_if = "Option::is_none", default)]
    pub ipv6: Option<String>,
    pub hostname: String,
}

/// VM sizing. `ram` is in MiB, `disk` in GiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    pub cpu: i64,
    pub ram: i64,
    pub disk: i64,
}

impl Features {
    /// Build from the server type sizing, where memory is given in GiB.
    pub fn from_gib(cpu: i64, ram_gib: i64, disk_gib: i64) -> Self {
        Self {
            cpu,
            ram: ram_gib * 1024,
            disk: disk_gib,
        }
    }
}

/// Where the hypervisor reports back once installation finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    pub endpoint: String,
    pub vm_id: i64,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParams {
    #[serde(rename = "site-id")]
    pub site_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub os: Option<String>,
    pub netconf: NetConf,
    pub features: Features,
    pub callback: Callback,
}

/// The hypervisor's name for a site, `mwssite-<id>`.
pub fn site_label(site_id: i64) -> String {
    format!("mwssite-{site_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonParams {
    pub action: ButtonAction,
    pub vmid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteParams {
    pub vmid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmCommand {
    Create(CreateParams),
    Delete(DeleteParams),
    Button(ButtonParams),
}

impl VmCommand {
    pub fn button(action: ButtonAction, vmid: impl Into<String>) -> Self {
        VmCommand::Button(ButtonParams {
            action,
            vmid: vmid.into(),
        })
    }

    pub fn delete(vmid: impl Into<String>) -> Self {
        VmCommand::Delete(DeleteParams { vmid: vmid.into() })
    }

    /// Command name as the VM API expects it on the command line.
    pub fn name(&self) -> &'static str {
        match self {
            VmCommand::Create(_) => "create",
            VmCommand::Delete(_) => "delete",
            VmCommand::Button(_) => "button",
        }
    }

    pub fn params_json(&self) -> Result<String> {
        let json = match self {
            VmCommand::Create(params) => serde_json::to_string(params)?,
            VmCommand::Delete(params) => serde_json::to_string(params)?,
            VmCommand::Button(params) => serde_json::to_string(params)?,
        };
        Ok(json)
    }
}

/// Unparsed stdout of a VM API call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateResponse {
    /// Hypervisor identifier, if the response carried one
    pub vmid: Option<String>,
}

impl RawResponse {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Interpret the response of a `create` call.
    ///
    /// `vmid` may be a string or a number. Any other shape, or a missing key,
    /// yields no identifier.
    pub fn create_response(&self) -> Result<CreateResponse> {
        let value: Value =
            serde_json::from_str(self.raw.trim()).map_err(|source| Error::MalformedResponse {
                raw: self.raw.clone(),
                source,
            })?;

        let vmid = match value.get("vmid") {
            Some(Value::String(id)) if !id.is_empty() => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        };

        Ok(CreateResponse { vmid })
    }
}
