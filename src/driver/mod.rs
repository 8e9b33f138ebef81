// Hypervisor driver abstraction.
//
// The pool core only ever talks to this trait; concrete backends
// (Firecracker, Cloud Hypervisor) and the test mock live behind it.

mod cloud_hypervisor;
mod firecracker;
mod mock;
mod uds;

pub use cloud_hypervisor::CloudHypervisorDriver;
pub use firecracker::FirecrackerDriver;
pub use mock::MockDriver;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Child;

use crate::config::{Backend, Settings};
use crate::spec::{Lifecycle, Spec};

/// Errors reported by a hypervisor backend.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("configure {endpoint} failed: {reason}")]
    Configure { endpoint: String, reason: String },
    #[error("instance start failed: {0}")]
    Start(String),
    #[error("api socket unreachable: {0}")]
    Unreachable(String),
    #[error("guest health check failed: {0}")]
    Health(String),
    #[error("warm-up failed: {0}")]
    WarmUp(String),
}

impl DriverError {
    /// Boot stage label carried into `PoolError::BootFailed`.
    pub fn boot_stage(&self) -> &'static str {
        match self {
            DriverError::Spawn(_) => "spawn",
            DriverError::Configure { .. } | DriverError::Unreachable(_) => "configure",
            DriverError::Start(_) => "start",
            DriverError::Health(_) => "health",
            DriverError::WarmUp(_) => "warm_up",
        }
    }
}

/// Everything a backend needs to bring one microVM up.
#[derive(Debug, Clone)]
pub struct BootRequest {
    pub vm_id: String,
    pub tenant: String,
    pub spec: Spec,
    pub tap_name: String,
    pub guest_ip: String,
    pub guest_port: u16,
    pub api_sock: PathBuf,
    pub metrics_path: PathBuf,
    pub log_path: PathBuf,
    pub health_timeout: Duration,
    pub health_interval: Duration,
}

/// Parameters for lifecycle pre-warming inside a booted guest.
#[derive(Debug, Clone)]
pub struct WarmUpRequest {
    pub vm_id: String,
    pub guest_ip: String,
    pub guest_port: u16,
    pub lifecycle: Lifecycle,
    pub warm_timeout: Duration,
}

/// Handle to a running hypervisor process.
#[derive(Debug)]
pub struct BootHandle {
    pub pid: Option<u32>,
    pub child: Option<Child>,
    pub api_sock: PathBuf,
    pub metrics_path: PathBuf,
}

/// Capability interface over one hypervisor backend.
///
/// `boot` and `warm_up` are long (multi-second) blocking calls from the
/// caller's perspective; `stop` must never fail observably.
#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Start the VM process, configure it, and begin execution.
    async fn boot(&self, req: &BootRequest) -> Result<BootHandle, DriverError>;

    /// Poll the guest health endpoint until it answers 200.
    ///
    /// Retries on connection errors, 5xx, and any other non-success status
    /// at the same cadence until the health deadline passes.
    async fn wait_ready(&self, req: &BootRequest) -> Result<(), DriverError> {
        poll_guest_health(req).await
    }

    /// Lifecycle-class-specific priming inside an already booted guest.
    async fn warm_up(&self, req: &WarmUpRequest) -> Result<(), DriverError> {
        prime_guest(req).await
    }

    /// Terminate the VM process and release host resources. Idempotent;
    /// unreachable processes are logged and reaped.
    async fn stop(&self, handle: &mut BootHandle) {
        if let Some(child) = handle.child.as_mut() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "hypervisor child already gone");
            }
        }
        handle.child = None;
        reap_pid(handle.pid.take());
    }
}

/// Instantiate the driver selected by `FC_BACKEND`.
pub fn for_backend(settings: &Settings) -> Arc<dyn HypervisorDriver> {
    match settings.backend {
        Backend::Firecracker => Arc::new(FirecrackerDriver::new(settings)),
        Backend::CloudHypervisor => Arc::new(CloudHypervisorDriver::new(settings)),
    }
}

/// Forcefully kill a PID that outlived its child handle.
pub(crate) fn reap_pid(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    if nix::sys::signal::kill(pid, None).is_ok() {
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL) {
            tracing::warn!(pid = %pid, error = %e, "Failed to SIGKILL hypervisor process");
        }
    }
}

async fn poll_guest_health(req: &BootRequest) -> Result<(), DriverError> {
    let url = format!("http://{}:{}/health", req.guest_ip, req.guest_port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| DriverError::Health(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + req.health_timeout;
    let mut last_error = String::from("no probe sent");
    loop {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => last_error = format!("status {}", resp.status()),
            Err(e) => last_error = e.to_string(),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DriverError::Health(format!(
                "{} not healthy within {:?}: {}",
                url, req.health_timeout, last_error
            )));
        }
        tokio::time::sleep(req.health_interval).await;
    }
}

async fn prime_guest(req: &WarmUpRequest) -> Result<(), DriverError> {
    // Intensity scales with the lifecycle class: services get the full
    // replica seed plus CDC subscription, daemons a light prime, one-shot
    // jobs nothing at all.
    let (intensity, timeout) = match req.lifecycle {
        Lifecycle::Service => ("full", req.warm_timeout),
        Lifecycle::Daemon => ("light", req.warm_timeout / 2),
        Lifecycle::Job => return Ok(()),
    };

    let url = format!("http://{}:{}/warm", req.guest_ip, req.guest_port);
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DriverError::WarmUp(e.to_string()))?;

    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "intensity": intensity }))
        .send()
        .await
        .map_err(|e| DriverError::WarmUp(e.to_string()))?;

    if resp.status().is_success() {
        Ok(())
    } else {
        Err(DriverError::WarmUp(format!(
            "guest warm endpoint answered {}",
            resp.status()
        )))
    }
}
