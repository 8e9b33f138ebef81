// Cloud Hypervisor backend: one CLI invocation, the VM auto-starts.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{BootHandle, BootRequest, DriverError, HypervisorDriver};
use crate::config::Settings;

pub struct CloudHypervisorDriver {
    bin: String,
    gateway: String,
}

impl CloudHypervisorDriver {
    pub fn new(settings: &Settings) -> Self {
        let gateway = settings
            .bridge_cidr
            .split('/')
            .next()
            .unwrap_or("172.30.0.1")
            .to_string();
        Self {
            bin: settings.cloud_hypervisor_bin.clone(),
            gateway,
        }
    }

    fn cmdline(&self, req: &BootRequest) -> String {
        let mut args = format!(
            "console=hvc0 ip={}::{}:255.255.255.0::eth0:off",
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
impl HypervisorDriver for CloudHypervisorDriver {
    async fn boot(&self, req: &BootRequest) -> Result<BootHandle, DriverError> {
        let log_file = std::fs::File::create(&req.log_path)
            .map_err(|e| DriverError::Spawn(format!("log file: {}", e)))?;
        let log_clone = log_file
            .try_clone()
            .map_err(|e| DriverError::Spawn(format!("log file: {}", e)))?;

        let child = Command::new(&self.bin)
            .arg("--api-socket")
            .arg(&req.api_sock)
            .arg("--kernel")
            .arg(&req.spec.kernel_path)
            .arg("--disk")
            .arg(format!("path={}", req.spec.rootfs_path))
            .arg("--cpus")
            .arg(format!("boot={}", req.spec.resources.vcpu))
            .arg("--memory")
            .arg(format!("size={}M", req.spec.resources.mem_mb))
            .arg("--net")
            .arg(format!("tap={}", req.tap_name))
            .arg("--cmdline")
            .arg(self.cmdline(req))
            .stdin(Stdio::null())
            .stdout(log_file)
            .stderr(log_clone)
            .spawn()
            .map_err(|e| DriverError::Spawn(e.to_string()))?;
        let pid = child.id();

        tracing::info!(
            vm_id = %req.vm_id,
            pid = pid.unwrap_or(0),
            "Cloud Hypervisor VM started"
        );

        Ok(BootHandle {
            pid,
            child: Some(child),
            api_sock: req.api_sock.clone(),
            metrics_path: req.metrics_path.clone(),
        })
    }
}
