// Firecracker backend: spawn the VMM, configure it over the API socket,
// then fire InstanceStart.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use super::uds;
use super::{BootHandle, BootRequest, DriverError, HypervisorDriver};
use crate::config::Settings;

const SOCKET_WAIT: Duration = Duration::from_secs(3);

pub struct FirecrackerDriver {
    bin: String,
    /// Guest default gateway, the bridge address.
    gateway: String,
}

impl FirecrackerDriver {
    pub fn new(settings: &Settings) -> Self {
        let gateway = settings
            .bridge_cidr
            .split('/')
            .next()
            .unwrap_or("172.30.0.1")
            .to_string();
        Self {
            bin: settings.firecracker_bin.clone(),
            gateway,
        }
    }

    fn boot_args(&self, req: &BootRequest) -> String {
        let mut args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:255.255.255.0::eth0:off",
            req.guest_ip, self.gateway
        );
        for (key, value) in &req.spec.env {
            args.push(' ');
            args.push_str(key);
            args.push('=');
            args.push_str(value);
        }
        if let Some((init, rest)) = req.spec.cmd.split_first() {
            args.push_str(" init=");
            args.push_str(init);
            if !rest.is_empty() {
                args.push_str(" -- ");
                args.push_str(&rest.join(" "));
            }
        }
        args
    }
}

#[async_trait]
impl HypervisorDriver for FirecrackerDriver {
    async fn boot(&self, req: &BootRequest) -> Result<BootHandle, DriverError> {
        let log_file = std::fs::File::create(&req.log_path)
            .map_err(|e| DriverError::Spawn(format!("log file: {}", e)))?;
        let log_clone = log_file
            .try_clone()
            .map_err(|e| DriverError::Spawn(format!("log file: {}", e)))?;

        let mut child = Command::new(&self.bin)
            .arg("--api-sock")
            .arg(&req.api_sock)
            .arg("--id")
            .arg(&req.vm_id)
            .stdin(Stdio::null())
            .stdout(log_file)
            .stderr(log_clone)
            .spawn()
            .map_err(|e| DriverError::Spawn(e.to_string()))?;
        let pid = child.id();

        // Everything past the spawn talks to the API socket; if any step
        // fails the half-configured VMM must not be left running.
        let configure = async {
            uds::wait_for_socket(&req.api_sock, SOCKET_WAIT).await?;

            uds::put_json(
                &req.api_sock,
                "/machine-config",
                &json!({
                    "vcpu_count": req.spec.resources.vcpu,
                    "mem_size_mib": req.spec.resources.mem_mb,
                    "smt": false,
                }),
            )
            .await?;

            uds::put_json(
                &req.api_sock,
                "/metrics",
                &json!({ "metrics_path": req.metrics_path }),
            )
            .await?;

            uds::put_json(
                &req.api_sock,
                "/boot-source",
                &json!({
                    "kernel_image_path": req.spec.kernel_path,
                    "boot_args": self.boot_args(req),
                }),
            )
            .await?;

            uds::put_json(
                &req.api_sock,
                "/drives/rootfs",
                &json!({
                    "drive_id": "rootfs",
                    "path_on_host": req.spec.rootfs_path,
                    "is_root_device": true,
                    "is_read_only": false,
                }),
            )
            .await?;

            uds::put_json(
                &req.api_sock,
                "/network-interfaces/eth0",
                &json!({
                    "iface_id": "eth0",
                    "host_dev_name": req.tap_name,
                }),
            )
            .await?;

            uds::put_json(
                &req.api_sock,
                "/actions",
                &json!({ "action_type": "InstanceStart" }),
            )
            .await
            .map_err(|e| DriverError::Start(e.to_string()))
        };

        if let Err(e) = configure.await {
            tracing::warn!(vm_id = %req.vm_id, error = %e, "Firecracker configure failed, killing VMM");
            if let Err(kill_err) = child.kill().await {
                tracing::debug!(vm_id = %req.vm_id, error = %kill_err, "VMM already gone");
            }
            return Err(e);
        }

        tracing::info!(
            vm_id = %req.vm_id,
            pid = pid.unwrap_or(0),
            api_sock = %req.api_sock.display(),
            "Firecracker VM started"
        );

        Ok(BootHandle {
            pid,
            child: Some(child),
            api_sock: req.api_sock.clone(),
            metrics_path: req.metrics_path.clone(),
        })
    }
}
