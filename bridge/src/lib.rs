//! Hypervisor API bridge and the external command runner shared by every
//! out-of-process collaborator.

pub mod command;
pub mod error;
pub mod protocol;
pub mod xen;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use command::{CommandOutput, ExternalCommand};
pub use error::{Error, Result};
pub use protocol::{
    ButtonAction, Callback, CreateParams, CreateResponse, Features, NetConf, RawResponse,
    VmCommand, site_label,
};
pub use xen::{HypervisorBridge, XenBridge};
