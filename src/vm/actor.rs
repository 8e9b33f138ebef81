// The VM actor task: owns one microVM process and its host resources.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::messages::VmCommand;
use super::status::VmStatus;
use super::{VmHandle, VmInfo};
use crate::config::Settings;
use crate::driver::{BootHandle, BootRequest, HypervisorDriver, WarmUpRequest};
use crate::error::PoolError;
use crate::metrics;
use crate::net::{HostNetwork, TapDevice};
use crate::proxy::{is_real_tenant, ProxyRegistry};
use crate::spec::{Fingerprint, Spec};

const INBOX_CAPACITY: usize = 16;

/// Timings and paths an actor needs, lifted out of [`Settings`].
#[derive(Debug, Clone)]
pub struct VmRuntimeConfig {
    pub state_dir: PathBuf,
    pub guest_port: u16,
    pub boot_deadline: Duration,
    pub health_timeout: Duration,
    pub health_interval: Duration,
    pub warm_timeout: Duration,
}

impl From<&Settings> for VmRuntimeConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            state_dir: settings.state_dir.clone(),
            guest_port: settings.guest_port,
            boot_deadline: settings.boot_deadline,
            health_timeout: settings.health_timeout,
            health_interval: settings.health_interval,
            warm_timeout: settings.warm_timeout,
        }
    }
}

/// Everything needed to spawn one actor.
pub struct VmActorParams {
    pub vm_id: String,
    pub fingerprint: Fingerprint,
    pub tenant: String,
    pub spec: Spec,
    pub driver: Arc<dyn HypervisorDriver>,
    pub network: Arc<dyn HostNetwork>,
    pub proxy: Arc<dyn ProxyRegistry>,
    pub runtime: VmRuntimeConfig,
}

/// One actor per microVM. A single serial inbox orders all commands.
pub struct VmActor {
    vm_id: String,
    fingerprint: Fingerprint,
    tenant: String,
    spec: Spec,
    status: VmStatus,
    tap: Option<TapDevice>,
    handle: Option<BootHandle>,
    registered: bool,
    driver: Arc<dyn HypervisorDriver>,
    network: Arc<dyn HostNetwork>,
    proxy: Arc<dyn ProxyRegistry>,
    runtime: VmRuntimeConfig,
    rx: mpsc::Receiver<VmCommand>,
}

impl VmActor {
    /// Spawn the actor task and return its handle.
    pub fn spawn(params: VmActorParams) -> VmHandle {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = VmHandle::new(params.vm_id.clone(), params.fingerprint.clone(), tx);
        let actor = VmActor {
            vm_id: params.vm_id,
            fingerprint: params.fingerprint,
            tenant: params.tenant,
            spec: params.spec,
            status: VmStatus::Init,
            tap: None,
            handle: None,
            registered: false,
            driver: params.driver,
            network: params.network,
            proxy: params.proxy,
            runtime: params.runtime,
            rx,
        };
        tokio::spawn(actor.run());
        handle
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                VmCommand::Info { reply } => {
                    let _ = reply.send(self.info());
                }
                VmCommand::Boot { reply } => {
                    let result = self.handle_boot().await;
                    let _ = reply.send(result);
                }
                VmCommand::WarmUp { reply } => {
                    let result = self.handle_warm_up().await;
                    let _ = reply.send(result);
                }
                VmCommand::UpdateTenant { tenant, reply } => {
                    let result = self.handle_update_tenant(tenant).await;
                    let _ = reply.send(result);
                }
                VmCommand::Stop { reply } => {
                    tracing::info!(vm_id = %self.vm_id, "Stopping VM");
                    self.cleanup().await;
                    self.status = VmStatus::Stopped;
                    let _ = reply.send(());
                    return;
                }
            }
        }

        // All handles dropped without an explicit stop. Host resources
        // still belong to this actor, so release them on the way out.
        if self.status != VmStatus::Stopped {
            tracing::warn!(vm_id = %self.vm_id, "VM actor inbox closed, releasing resources");
            self.cleanup().await;
            self.status = VmStatus::Stopped;
        }
    }

    fn info(&self) -> VmInfo {
        VmInfo {
            vm_id: self.vm_id.clone(),
            tenant: self.tenant.clone(),
            fingerprint: self.fingerprint.clone(),
            status: self.status,
            guest_ip: self.tap.as_ref().map(|t| t.guest_ip.clone()),
            guest_port: self.runtime.guest_port,
        }
    }

    fn api_sock_path(&self) -> PathBuf {
        self.runtime.state_dir.join(format!("{}.sock", self.vm_id))
    }

    fn metrics_path(&self) -> PathBuf {
        self.runtime.state_dir.join(format!("{}.metrics", self.vm_id))
    }

    fn log_path(&self) -> PathBuf {
        self.runtime.state_dir.join(format!("{}.log", self.vm_id))
    }

    async fn handle_boot(&mut self) -> Result<VmInfo, PoolError> {
        match self.status {
            VmStatus::Init => {}
            VmStatus::Running | VmStatus::Warm => return Ok(self.info()),
            other => {
                return Err(PoolError::BootFailed {
                    vm_id: self.vm_id.clone(),
                    stage: "state".into(),
                    reason: format!("cannot boot from {:?}", other),
                })
            }
        }

        self.status = VmStatus::Booting;
        tracing::info!(vm_id = %self.vm_id, tenant = %self.tenant, "Booting VM");

        let deadline = self.runtime.boot_deadline;
        match tokio::time::timeout(deadline, self.boot_sequence()).await {
            Ok(Ok(())) => {
                self.status = VmStatus::Running;
                if is_real_tenant(&self.tenant) {
                    self.register_with_proxy().await;
                }
                metrics::inc_boot("ok");
                tracing::info!(
                    vm_id = %self.vm_id,
                    guest_ip = %self.tap.as_ref().map(|t| t.guest_ip.as_str()).unwrap_or("-"),
                    "VM running"
                );
                Ok(self.info())
            }
            Ok(Err(e)) => {
                tracing::error!(vm_id = %self.vm_id, error = %e, "Boot failed");
                self.cleanup().await;
                self.status = VmStatus::Failed;
                metrics::inc_boot("error");
                Err(e)
            }
            Err(_) => {
                tracing::error!(vm_id = %self.vm_id, ?deadline, "Boot exceeded deadline");
                self.cleanup().await;
                self.status = VmStatus::Failed;
                metrics::inc_boot("timeout");
                Err(PoolError::BootFailed {
                    vm_id: self.vm_id.clone(),
                    stage: "deadline".into(),
                    reason: format!("boot exceeded {:?}", deadline),
                })
            }
        }
    }

    async fn boot_sequence(&mut self) -> Result<(), PoolError> {
        // A crashed predecessor with the same vm id may have left sockets
        // and metrics files behind; clear them before reuse.
        self.clear_stale_files();

        let tap = self
            .network
            .create_tap(&self.vm_id)
            .await
            .map_err(|e| PoolError::BootFailed {
                vm_id: self.vm_id.clone(),
                stage: "tap".into(),
                reason: e.to_string(),
            })?;
        self.tap = Some(tap);

        let req = self.boot_request();
        let handle = self
            .driver
            .boot(&req)
            .await
            .map_err(|e| self.boot_failed(e))?;
        self.handle = Some(handle);

        self.driver
            .wait_ready(&req)
            .await
            .map_err(|e| self.boot_failed(e))
    }

    fn boot_request(&self) -> BootRequest {
        let tap = self.tap.as_ref().expect("tap created before boot request");
        BootRequest {
            vm_id: self.vm_id.clone(),
            tenant: self.tenant.clone(),
            spec: self.spec.clone(),
            tap_name: tap.tap_name.clone(),
            guest_ip: tap.guest_ip.clone(),
            guest_port: self.runtime.guest_port,
            api_sock: self.api_sock_path(),
            metrics_path: self.metrics_path(),
            log_path: self.log_path(),
            health_timeout: self.runtime.health_timeout,
            health_interval: self.runtime.health_interval,
        }
    }

    fn boot_failed(&self, e: crate::driver::DriverError) -> PoolError {
        PoolError::BootFailed {
            vm_id: self.vm_id.clone(),
            stage: e.boot_stage().into(),
            reason: e.to_string(),
        }
    }

    async fn handle_warm_up(&mut self) -> Result<(), PoolError> {
        if self.status != VmStatus::Running {
            return Err(PoolError::WarmUpFailed {
                vm_id: self.vm_id.clone(),
                reason: format!("cannot warm up from {:?}", self.status),
            });
        }
        let guest_ip = self
            .tap
            .as_ref()
            .map(|t| t.guest_ip.clone())
            .unwrap_or_default();
        let req = WarmUpRequest {
            vm_id: self.vm_id.clone(),
            guest_ip,
            guest_port: self.runtime.guest_port,
            lifecycle: self.spec.lifecycle,
            warm_timeout: self.runtime.warm_timeout,
        };

        match self.driver.warm_up(&req).await {
            Ok(()) => {
                // Warm VMs keep running but are invisible to the proxy;
                // boot never registered a sentinel tenant.
                self.status = VmStatus::Warm;
                metrics::inc_warm_up("ok");
                tracing::info!(vm_id = %self.vm_id, lifecycle = ?self.spec.lifecycle, "VM warm");
                Ok(())
            }
            Err(e) => {
                metrics::inc_warm_up("error");
                tracing::warn!(vm_id = %self.vm_id, error = %e, "Warm-up failed");
                Err(PoolError::WarmUpFailed {
                    vm_id: self.vm_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn handle_update_tenant(&mut self, tenant: String) -> Result<VmInfo, PoolError> {
        tracing::info!(
            vm_id = %self.vm_id,
            old_tenant = %self.tenant,
            new_tenant = %tenant,
            "Updating tenant"
        );

        if self.registered {
            self.proxy.deregister(&self.tenant, &self.vm_id).await;
            self.registered = false;
        }
        self.tenant = tenant;

        if self.status.is_up() {
            self.status = VmStatus::Running;
            if is_real_tenant(&self.tenant) {
                self.register_with_proxy().await;
            }
        }
        Ok(self.info())
    }

    async fn register_with_proxy(&mut self) {
        let Some(tap) = self.tap.as_ref() else { return };
        self.proxy
            .register(&self.tenant, &self.vm_id, &tap.guest_ip, self.runtime.guest_port)
            .await;
        self.registered = true;
    }

    /// Release everything this actor owns. Safe to call repeatedly and on
    /// every exit path; individual steps tolerate already-gone resources.
    async fn cleanup(&mut self) {
        if self.registered {
            self.proxy.deregister(&self.tenant, &self.vm_id).await;
            self.registered = false;
        }
        if let Some(mut handle) = self.handle.take() {
            self.driver.stop(&mut handle).await;
        }
        if let Some(tap) = self.tap.take() {
            self.network.delete_tap(&tap.tap_name).await;
        }
        self.clear_stale_files();
    }

    fn clear_stale_files(&self) {
        for path in [self.api_sock_path(), self.metrics_path()] {
            let _ = std::fs::remove_file(&path);
            let _ = std::fs::remove_file(PathBuf::from(format!("{}.old", path.display())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::net::StaticNetwork;
    use crate::proxy::{ProxyCall, RecordingProxy, WARM_SENTINEL};
    use crate::spec::{fingerprint, Lifecycle, Resources, Spec, WarmPool};
    use std::collections::BTreeMap;

    struct Harness {
        driver: Arc<MockDriver>,
        network: Arc<StaticNetwork>,
        proxy: Arc<RecordingProxy>,
        _state_dir: tempfile::TempDir,
        runtime: VmRuntimeConfig,
    }

    impl Harness {
        fn new() -> Self {
            let state_dir = tempfile::tempdir().unwrap();
            let runtime = VmRuntimeConfig {
                state_dir: state_dir.path().to_path_buf(),
                guest_port: 8080,
                boot_deadline: Duration::from_secs(5),
                health_timeout: Duration::from_secs(1),
                health_interval: Duration::from_millis(10),
                warm_timeout: Duration::from_secs(1),
            };
            Self {
                driver: Arc::new(MockDriver::new()),
                network: Arc::new(StaticNetwork::new()),
                proxy: Arc::new(RecordingProxy::new()),
                _state_dir: state_dir,
                runtime,
            }
        }

        fn spawn(&self, vm_id: &str, tenant: &str, spec: Spec) -> VmHandle {
            VmActor::spawn(VmActorParams {
                vm_id: vm_id.to_string(),
                fingerprint: fingerprint(&spec),
                tenant: tenant.to_string(),
                spec,
                driver: self.driver.clone(),
                network: self.network.clone(),
                proxy: self.proxy.clone(),
                runtime: self.runtime.clone(),
            })
        }
    }

    fn service_spec() -> Spec {
        Spec {
            kernel_path: "/k".into(),
            rootfs_path: "/r".into(),
            cmd: vec!["/bin/app".into()],
            env: BTreeMap::new(),
            resources: Resources { vcpu: 1, mem_mb: 128 },
            lifecycle: Lifecycle::Service,
            warm_pool: Some(WarmPool { min: 1, max: None }),
            extra: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn boot_with_real_tenant_registers_once() {
        let h = Harness::new();
        let vm = h.spawn("vm-a", "web-1", service_spec());

        let info = vm.boot().await.unwrap();
        assert_eq!(info.status, VmStatus::Running);
        assert!(info.guest_ip.is_some());
        assert_eq!(h.proxy.registrations_for("vm-a"), 1);

        vm.stop().await;
        assert_eq!(h.proxy.deregistrations_for("vm-a"), 1);
        assert_eq!(h.driver.stop_count(), 1);
    }

    #[tokio::test]
    async fn warm_sentinel_boot_stays_hidden_from_proxy() {
        let h = Harness::new();
        let vm = h.spawn("vm-w", WARM_SENTINEL, service_spec());

        vm.boot().await.unwrap();
        vm.warm_up().await.unwrap();
        let info = vm.info().await.unwrap();
        assert_eq!(info.status, VmStatus::Warm);
        assert!(h.proxy.calls().is_empty());

        vm.stop().await;
        assert!(h.proxy.calls().is_empty());
    }

    #[tokio::test]
    async fn promotion_registers_exactly_once_under_new_tenant() {
        let h = Harness::new();
        let vm = h.spawn("vm-p", WARM_SENTINEL, service_spec());
        vm.boot().await.unwrap();
        vm.warm_up().await.unwrap();

        let info = vm.update_tenant("web-1").await.unwrap();
        assert_eq!(info.status, VmStatus::Running);
        assert_eq!(info.tenant, "web-1");
        assert_eq!(
            h.proxy.calls(),
            vec![ProxyCall::Register {
                tenant: "web-1".into(),
                vm_id: "vm-p".into()
            }]
        );

        vm.stop().await;
        assert_eq!(h.proxy.deregistrations_for("vm-p"), 1);
    }

    #[tokio::test]
    async fn tenant_swap_rewires_registration() {
        let h = Harness::new();
        let vm = h.spawn("vm-s", "old-tenant", service_spec());
        vm.boot().await.unwrap();

        vm.update_tenant("new-tenant").await.unwrap();
        assert_eq!(
            h.proxy.calls(),
            vec![
                ProxyCall::Register { tenant: "old-tenant".into(), vm_id: "vm-s".into() },
                ProxyCall::Deregister { tenant: "old-tenant".into(), vm_id: "vm-s".into() },
                ProxyCall::Register { tenant: "new-tenant".into(), vm_id: "vm-s".into() },
            ]
        );
        vm.stop().await;
    }

    #[tokio::test]
    async fn boot_failure_cleans_up_and_parks_in_failed() {
        let h = Harness::new();
        h.driver.fail_next_boots(1);
        let vm = h.spawn("vm-f", "web-1", service_spec());

        let err = vm.boot().await.unwrap_err();
        assert!(matches!(err, PoolError::BootFailed { .. }));

        let info = vm.info().await.unwrap();
        assert_eq!(info.status, VmStatus::Failed);
        // TAP released, nothing registered.
        assert!(h.network.live_taps().is_empty());
        assert!(h.proxy.calls().is_empty());
    }

    #[tokio::test]
    async fn warm_up_failure_leaves_vm_running() {
        let h = Harness::new();
        h.driver.fail_next_warm_ups(1);
        let vm = h.spawn("vm-wf", WARM_SENTINEL, service_spec());
        vm.boot().await.unwrap();

        let err = vm.warm_up().await.unwrap_err();
        assert!(matches!(err, PoolError::WarmUpFailed { .. }));
        assert_eq!(vm.info().await.unwrap().status, VmStatus::Running);
        vm.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_removes_artifacts() {
        let h = Harness::new();
        let vm = h.spawn("vm-i", "web-1", service_spec());
        vm.boot().await.unwrap();

        let sock = h.runtime.state_dir.join("vm-i.sock");
        assert!(sock.exists());

        vm.stop().await;
        vm.stop().await;
        assert!(!sock.exists());
        assert!(h.network.live_taps().is_empty());
        assert_eq!(h.driver.stop_count(), 1);
        assert_eq!(h.proxy.deregistrations_for("vm-i"), 1);
        assert!(!vm.is_alive());
    }

    #[tokio::test]
    async fn job_lifecycle_vm_still_parks_warm() {
        let h = Harness::new();
        let mut spec = service_spec();
        spec.lifecycle = Lifecycle::Job;
        let vm = h.spawn("vm-j", WARM_SENTINEL, spec);
        vm.boot().await.unwrap();
        vm.warm_up().await.unwrap();
        assert_eq!(vm.info().await.unwrap().status, VmStatus::Warm);
        vm.stop().await;
    }
}
