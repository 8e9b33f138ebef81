// Load-balancer registration hook.
//
// Exposure rule: a VM is registered iff it is Running under a real job
// tenant. Warm-sentinel VMs stay invisible to the proxy.

use async_trait::async_trait;

/// Tenant used for warm VMs that are not yet bound to a job. Never
/// registered with the proxy.
pub const WARM_SENTINEL: &str = "_warm";

/// True when `tenant` belongs to an actual job rather than the warm pool.
pub fn is_real_tenant(tenant: &str) -> bool {
    tenant != WARM_SENTINEL
}

/// Narrow interface to the load balancer's backend registry.
#[async_trait]
pub trait ProxyRegistry: Send + Sync {
    async fn register(&self, tenant: &str, vm_id: &str, ip: &str, port: u16);
    async fn deregister(&self, tenant: &str, vm_id: &str);
}

/// Default hook: the real balancer integration lives out of process, so
/// this just leaves an audit trail.
pub struct LoggingProxy;

#[async_trait]
impl ProxyRegistry for LoggingProxy {
    async fn register(&self, tenant: &str, vm_id: &str, ip: &str, port: u16) {
        tracing::info!(tenant = %tenant, vm_id = %vm_id, ip = %ip, port = port, "Proxy register");
    }

    async fn deregister(&self, tenant: &str, vm_id: &str) {
        tracing::info!(tenant = %tenant, vm_id = %vm_id, "Proxy deregister");
    }
}

/// Call recorded by [`RecordingProxy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCall {
    Register { tenant: String, vm_id: String },
    Deregister { tenant: String, vm_id: String },
}

/// Test hook capturing the exact register/deregister sequence.
#[derive(Default)]
pub struct RecordingProxy {
    calls: std::sync::Mutex<Vec<ProxyCall>>,
}

impl RecordingProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ProxyCall> {
        self.calls.lock().expect("proxy lock").clone()
    }

    pub fn registrations_for(&self, vm_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ProxyCall::Register { vm_id: v, .. } if v == vm_id))
            .count()
    }

    pub fn deregistrations_for(&self, vm_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ProxyCall::Deregister { vm_id: v, .. } if v == vm_id))
            .count()
    }
}

#[async_trait]
impl ProxyRegistry for RecordingProxy {
    async fn register(&self, tenant: &str, vm_id: &str, _ip: &str, _port: u16) {
        self.calls.lock().expect("proxy lock").push(ProxyCall::Register {
            tenant: tenant.to_string(),
            vm_id: vm_id.to_string(),
        });
    }

    async fn deregister(&self, tenant: &str, vm_id: &str) {
        self.calls
            .lock()
            .expect("proxy lock")
            .push(ProxyCall::Deregister {
                tenant: tenant.to_string(),
                vm_id: vm_id.to_string(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warm_sentinel_is_not_a_real_tenant() {
        assert!(!is_real_tenant(WARM_SENTINEL));
        assert!(is_real_tenant("web-1"));
    }
}
