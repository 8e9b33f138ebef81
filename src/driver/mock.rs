// In-memory hypervisor backend for tests.
//
// Records every call, supports per-stage failure injection, and creates
// the socket/metrics artifacts so cleanup paths have something to remove.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BootHandle, BootRequest, DriverError, HypervisorDriver, WarmUpRequest};

#[derive(Default)]
pub struct MockDriver {
    boots: AtomicU64,
    warm_ups: AtomicU64,
    stops: AtomicU64,
    fail_boots: AtomicU64,
    fail_warm_ups: AtomicU64,
    booted: Mutex<Vec<String>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` boot calls fail at the spawn stage.
    pub fn fail_next_boots(&self, n: u64) {
        self.fail_boots.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` warm-up calls fail.
    pub fn fail_next_warm_ups(&self, n: u64) {
        self.fail_warm_ups.store(n, Ordering::SeqCst);
    }

    pub fn boot_count(&self) -> u64 {
        self.boots.load(Ordering::SeqCst)
    }

    pub fn warm_up_count(&self) -> u64 {
        self.warm_ups.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn booted_vm_ids(&self) -> Vec<String> {
        self.booted.lock().expect("mock lock").clone()
    }

    fn take_failure(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl HypervisorDriver for MockDriver {
    async fn boot(&self, req: &BootRequest) -> Result<BootHandle, DriverError> {
        if Self::take_failure(&self.fail_boots) {
            return Err(DriverError::Spawn("injected boot failure".into()));
        }
        self.boots.fetch_add(1, Ordering::SeqCst);
        self.booted
            .lock()
            .expect("mock lock")
            .push(req.vm_id.clone());
        // Leave the same host artifacts a real backend would.
        let _ = std::fs::File::create(&req.api_sock);
        let _ = std::fs::File::create(&req.metrics_path);
        Ok(BootHandle {
            pid: None,
            child: None,
            api_sock: req.api_sock.clone(),
            metrics_path: req.metrics_path.clone(),
        })
    }

    async fn wait_ready(&self, _req: &BootRequest) -> Result<(), DriverError> {
        Ok(())
    }

    async fn warm_up(&self, _req: &WarmUpRequest) -> Result<(), DriverError> {
        if Self::take_failure(&self.fail_warm_ups) {
            return Err(DriverError::WarmUp("injected warm-up failure".into()));
        }
        self.warm_ups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, handle: &mut BootHandle) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        handle.child = None;
        handle.pid = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Lifecycle, Resources, Spec};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request(dir: &std::path::Path) -> BootRequest {
        BootRequest {
            vm_id: "mock-0".into(),
            tenant: "t".into(),
            spec: Spec {
                kernel_path: "/k".into(),
                rootfs_path: "/r".into(),
                cmd: vec![],
                env: BTreeMap::new(),
                resources: Resources { vcpu: 1, mem_mb: 64 },
                lifecycle: Lifecycle::Job,
                warm_pool: None,
                extra: BTreeMap::new(),
            },
            tap_name: "tap-test-0".into(),
            guest_ip: "192.168.100.2".into(),
            guest_port: 8080,
            api_sock: dir.join("mock-0.sock"),
            metrics_path: dir.join("mock-0.metrics"),
            log_path: dir.join("mock-0.log"),
            health_timeout: Duration::from_secs(1),
            health_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn failure_injection_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let driver = MockDriver::new();
        driver.fail_next_boots(1);

        let req = request(dir.path());
        assert!(driver.boot(&req).await.is_err());
        assert!(driver.boot(&req).await.is_ok());
        assert_eq!(driver.boot_count(), 1);
    }

    #[tokio::test]
    async fn boot_leaves_host_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let driver = MockDriver::new();
        let req = request(dir.path());
        let mut handle = driver.boot(&req).await.unwrap();
        assert!(req.api_sock.exists());
        assert!(req.metrics_path.exists());
        driver.stop(&mut handle).await;
        assert_eq!(driver.stop_count(), 1);
    }
}
