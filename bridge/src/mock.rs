//! Mock hypervisor bridge for unit testing.
//!
//! [`MockBridge`] records every command it receives without running any
//! process. Failures and malformed responses can be injected through
//! [`MockBridgeConfig`], and button presses can be held in flight to exercise
//! concurrent dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};

use crate::error::{Error, Result};
use crate::protocol::{RawResponse, VmCommand};
use crate::xen::HypervisorBridge;

// ─── Configuration for failure injection ──────────────────────────────────

/// Controls how the mock answers. Defaults to success everywhere.
#[derive(Debug, Clone, Default)]
pub struct MockBridgeConfig {
    /// Raw stdout returned by `create`. Defaults to `{"vmid": "xen-<vm_id>"}`
    pub create_response: Option<String>,
    /// If set, `create` fails with this output
    pub create_error: Option<String>,
    /// Only the first N `create` calls fail (0 = all of them)
    pub create_error_times: usize,
    /// If set, `delete` fails with this output
    pub delete_error: Option<String>,
    /// If set, `button` fails with this output
    pub button_error: Option<String>,
    /// Park every `button` call until [`MockCallTracker::release_buttons`]
    pub hold_buttons: bool,
}

// ─── Call tracker ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub host: String,
    pub command: VmCommand,
}

/// Shared view of what the mock was asked to do.
#[derive(Debug, Clone)]
pub struct MockCallTracker {
    pub creates: Arc<AtomicUsize>,
    pub deletes: Arc<AtomicUsize>,
    pub buttons: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    entered: Arc<Notify>,
    gate: Arc<Semaphore>,
}

impl Default for MockCallTracker {
    fn default() -> Self {
        Self {
            creates: Arc::default(),
            deletes: Arc::default(),
            buttons: Arc::default(),
            calls: Arc::default(),
            entered: Arc::new(Notify::new()),
            gate: Arc::new(Semaphore::new(0)),
        }
    }
}

impl MockCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn button_count(&self) -> usize {
        self.buttons.load(Ordering::SeqCst)
    }

    /// Every call in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Wait until a held `button` call has started.
    pub async fn button_entered(&self) {
        self.entered.notified().await;
    }

    /// Let `n` held `button` calls finish.
    pub fn release_buttons(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn record(&self, host: &str, command: &VmCommand) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                host: host.to_string(),
                command: command.clone(),
            });
        }
    }
}

// ─── Mock bridge ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MockBridge {
    pub tracker: MockCallTracker,
    pub config: MockBridgeConfig,
}

impl MockBridge {
    /// Create a new mock bridge with default (all-success) config.
    pub fn new() -> (Self, MockCallTracker) {
        Self::with_config(MockBridgeConfig::default())
    }

    /// Create a mock bridge with failure injection.
    pub fn with_config(config: MockBridgeConfig) -> (Self, MockCallTracker) {
        let tracker = MockCallTracker::new();
        let bridge = Self {
            tracker: tracker.clone(),
            config,
        };
        (bridge, tracker)
    }
}

fn failure(output: &str) -> Error {
    Error::Failure {
        program: "mock-vm-api".to_string(),
        exit_code: Some(1),
        output: output.to_string(),
    }
}

impl HypervisorBridge for MockBridge {
    async fn invoke(&self, target_host: &str, command: &VmCommand) -> Result<RawResponse> {
        self.tracker.record(target_host, command);

        match command {
            VmCommand::Create(params) => {
                let n = self.tracker.creates.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(ref e) = self.config.create_error {
                    if self.config.create_error_times == 0 || n <= self.config.create_error_times {
                        return Err(failure(e));
                    }
                }
                let raw = match self.config.create_response {
                    Some(ref raw) => raw.clone(),
                    None => format!(r#"{{"vmid": "xen-{}"}}"#, params.callback.vm_id),
                };
                Ok(RawResponse::new(raw))
            }
            VmCommand::Delete(_) => {
                self.tracker.deletes.fetch_add(1, Ordering::SeqCst);
                if let Some(ref e) = self.config.delete_error {
                    return Err(failure(e));
                }
                Ok(RawResponse::new("{}"))
            }
            VmCommand::Button(_) => {
                self.tracker.buttons.fetch_add(1, Ordering::SeqCst);
                if self.config.hold_buttons {
                    self.tracker.entered.notify_one();
                    if let Ok(permit) = self.tracker.gate.acquire().await {
                        permit.forget();
                    }
                }
                if let Some(ref e) = self.config.button_error {
                    return Err(failure(e));
                }
                Ok(RawResponse::new("{}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ButtonAction, Callback, CreateParams, Features, NetConf};

    fn create(vm_id: i64) -> VmCommand {
        VmCommand::Create(CreateParams {
            site_id: "mwssite-1".to_string(),
            os: None,
            netconf: NetConf {
                ipv4: "192.0.2.1".to_string(),
                ipv6: None,
                hostname: "host1.example.org".to_string(),
            },
            features: Features::from_gib(1, 1, 20),
            callback: Callback {
                endpoint: "http://localhost/callbacks/post-installation".to_string(),
                vm_id,
                secret: "s".to_string(),
            },
        })
    }

    #[tokio::test]
    async fn default_create_answers_with_a_vmid() {
        let (bridge, tracker) = MockBridge::new();
        let response = bridge.invoke("xen1", &create(5)).await.unwrap();

        assert_eq!(response.create_response().unwrap().vmid.as_deref(), Some("xen-5"));
        assert_eq!(tracker.create_count(), 1);
        assert_eq!(tracker.calls()[0].host, "xen1");
    }

    #[tokio::test]
    async fn create_error_times_limits_injected_failures() {
        let (bridge, tracker) = MockBridge::with_config(MockBridgeConfig {
            create_error: Some("hypervisor busy".to_string()),
            create_error_times: 1,
            ..Default::default()
        });

        assert!(bridge.invoke("xen1", &create(1)).await.is_err());
        assert!(bridge.invoke("xen1", &create(1)).await.is_ok());
        assert_eq!(tracker.create_count(), 2);
    }

    #[tokio::test]
    async fn held_buttons_wait_for_release() {
        let (bridge, tracker) = MockBridge::with_config(MockBridgeConfig {
            hold_buttons: true,
            ..Default::default()
        });

        let call = tokio::spawn({
            let bridge = bridge.clone();
            async move {
                bridge
                    .invoke("xen1", &VmCommand::button(ButtonAction::PowerOn, "xen-1"))
                    .await
            }
        });

        tracker.button_entered().await;
        assert!(!call.is_finished());

        tracker.release_buttons(1);
        assert!(call.await.unwrap().is_ok());
        assert_eq!(tracker.button_count(), 1);
    }
}
