// Host network collaborator.
//
// Bridge/NAT provisioning happens outside this process; the pool only
// needs a TAP per VM and a deterministic guest address. Both live behind
// a trait so tests never touch the host.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// A TAP interface handed to one VM, plus the guest address routed to it.
#[derive(Debug, Clone)]
pub struct TapDevice {
    pub tap_name: String,
    pub guest_ip: String,
}

/// Narrow interface the pool consumes for per-VM host networking.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    /// Create a TAP for `vm_id` and allocate its guest address.
    async fn create_tap(&self, vm_id: &str) -> Result<TapDevice>;

    /// Tear the TAP down. Idempotent; never raises.
    async fn delete_tap(&self, tap_name: &str);
}

/// Real implementation: TAPs enslaved to the configured bridge via `ip`.
pub struct BridgedNetwork {
    bridge: String,
    subnet_prefix: String,
}

impl BridgedNetwork {
    pub fn new(bridge: &str, subnet_prefix: &str) -> Self {
        Self {
            bridge: bridge.to_string(),
            subnet_prefix: subnet_prefix.to_string(),
        }
    }

    /// Deterministic guest address: hash of the vm id picks the last octet
    /// (2-254 to avoid network/broadcast addresses).
    fn allocate_ip(&self, vm_id: &str) -> String {
        let mut hasher = DefaultHasher::new();
        vm_id.hash(&mut hasher);
        let last_octet = 2 + (hasher.finish() % 253) as u8;
        format!("{}.{}", self.subnet_prefix, last_octet)
    }

    /// Interface names cap at 15 bytes; the vm id (fingerprint prefix plus
    /// counter) stays unique after truncation for realistic pool sizes.
    fn tap_name(vm_id: &str) -> String {
        let mut name = format!("fc-{}", vm_id.to_lowercase());
        name.truncate(15);
        name
    }

    async fn run_ip(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("ip").args(args).output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(anyhow!(
                "ip {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[async_trait]
impl HostNetwork for BridgedNetwork {
    async fn create_tap(&self, vm_id: &str) -> Result<TapDevice> {
        let tap_name = Self::tap_name(vm_id);
        self.run_ip(&["tuntap", "add", &tap_name, "mode", "tap"])
            .await?;
        self.run_ip(&["link", "set", &tap_name, "master", &self.bridge])
            .await?;
        self.run_ip(&["link", "set", &tap_name, "up"]).await?;

        let guest_ip = self.allocate_ip(vm_id);
        tracing::debug!(tap = %tap_name, guest_ip = %guest_ip, "TAP created");
        Ok(TapDevice { tap_name, guest_ip })
    }

    async fn delete_tap(&self, tap_name: &str) {
        if let Err(e) = self.run_ip(&["link", "del", tap_name]).await {
            tracing::debug!(tap = %tap_name, error = %e, "TAP delete skipped");
        }
    }
}

/// Test implementation: hands out addresses without touching the host and
/// remembers which TAPs are currently "up".
#[derive(Default)]
pub struct StaticNetwork {
    next: AtomicU8,
    live: std::sync::Mutex<Vec<String>>,
}

impl StaticNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// TAP names created but not yet deleted.
    pub fn live_taps(&self) -> Vec<String> {
        self.live.lock().expect("static network lock").clone()
    }
}

#[async_trait]
impl HostNetwork for StaticNetwork {
    async fn create_tap(&self, vm_id: &str) -> Result<TapDevice> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let tap_name = BridgedNetwork::tap_name(vm_id);
        self.live
            .lock()
            .expect("static network lock")
            .push(tap_name.clone());
        Ok(TapDevice {
            tap_name,
            guest_ip: format!("192.168.100.{}", 2 + n % 253),
        })
    }

    async fn delete_tap(&self, tap_name: &str) {
        self.live
            .lock()
            .expect("static network lock")
            .retain(|t| t != tap_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_allocation_is_deterministic_and_in_range() {
        let net = BridgedNetwork::new("fcbr0", "172.30.0");
        let ip1 = net.allocate_ip("ABCD1234-0");
        let ip2 = net.allocate_ip("ABCD1234-0");
        assert_eq!(ip1, ip2);

        for i in 0..100 {
            let ip = net.allocate_ip(&format!("vm-{}", i));
            assert!(ip.starts_with("172.30.0."));
            let last_octet: u8 = ip.split('.').next_back().unwrap().parse().unwrap();
            assert!((2..=254).contains(&last_octet));
        }
    }

    #[test]
    fn tap_names_fit_interface_limit() {
        let name = BridgedNetwork::tap_name("ABCD1234EFGH5678-12");
        assert!(name.len() <= 15);
        assert!(name.starts_with("fc-"));
    }

    #[tokio::test]
    async fn static_network_tracks_live_taps() {
        let net = StaticNetwork::new();
        let tap = net.create_tap("vm-1").await.unwrap();
        assert_eq!(net.live_taps(), vec![tap.tap_name.clone()]);
        net.delete_tap(&tap.tap_name).await;
        assert!(net.live_taps().is_empty());
        // Deleting again is a no-op.
        net.delete_tap(&tap.tap_name).await;
    }
}
