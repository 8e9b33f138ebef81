//! Runtime settings for the pool control plane.

use std::path::PathBuf;
use std::time::Duration;

use super::error::ConfigError;

/// Hypervisor backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Firecracker,
    CloudHypervisor,
}

impl Backend {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "firecracker" => Ok(Backend::Firecracker),
            "cloud_hypervisor" => Ok(Backend::CloudHypervisor),
            other => Err(ConfigError::InvalidValue {
                key: "FC_BACKEND".into(),
                value: other.into(),
                reason: "expected 'firecracker' or 'cloud_hypervisor'".into(),
            }),
        }
    }
}

/// Pool control-plane configuration.
///
/// Everything is overridable through `FC_*` environment variables; defaults
/// match a single-host Linux deployment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Selected hypervisor backend (`FC_BACKEND`).
    pub backend: Backend,
    /// Default kernel image for desired entries that omit one (`FC_KERNEL`).
    pub kernel_path: String,
    /// Default rootfs image for desired entries that omit one (`FC_ROOTFS`).
    pub rootfs_path: String,
    /// Default warm-pool minimum applied by operators (`FC_WARM`).
    pub warm_default: u32,
    /// Ceiling on concurrently live VMs (`FC_MAX`).
    pub max_vms: usize,
    /// Host bridge the TAPs are enslaved to (`FC_BRIDGE`).
    pub bridge: String,
    /// Bridge address in CIDR form (`FC_BRIDGE_CIDR`).
    pub bridge_cidr: String,
    /// First three octets of the guest subnet (`FC_SUBNET_PREFIX`).
    pub subnet_prefix: String,
    /// Egress interface used for NAT (`FC_OUT_IFACE`).
    pub out_iface: String,
    /// Port the guest workload and health endpoint listen on (`FC_GUEST_PORT`).
    pub guest_port: u16,
    /// Port the control API listens on (`FC_PORT`).
    pub api_port: u16,
    /// Directory for sockets, metrics files, logs, and the database
    /// (`FC_STATE_DIR`).
    pub state_dir: PathBuf,
    /// Declarative desired-state file read at startup (`FC_DESIRED_PATH`).
    pub desired_path: PathBuf,
    /// SQLite database holding the desired set (`FC_DB_PATH`).
    pub db_path: PathBuf,
    /// Hypervisor binaries.
    pub firecracker_bin: String,
    pub cloud_hypervisor_bin: String,
    /// Overall deadline for one boot attempt.
    pub boot_deadline: Duration,
    /// Deadline for the guest health poll (`FC_HEALTH_TIMEOUT_SECS`).
    pub health_timeout: Duration,
    /// Interval between guest health probes.
    pub health_interval: Duration,
    /// Deadline for lifecycle pre-warming.
    pub warm_timeout: Duration,
    /// Reconciler tick interval (`FC_RECONCILE_MS`).
    pub reconcile_interval: Duration,
    /// Overall deadline for one attach call.
    pub attach_timeout: Duration,
}

impl Settings {
    /// Load settings from the environment on top of the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    /// Apply `FC_*` environment variable overrides to this configuration.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("FC_BACKEND") {
            self.backend = Backend::parse(&val)?;
        }
        if let Ok(val) = std::env::var("FC_KERNEL") {
            self.kernel_path = val;
        }
        if let Ok(val) = std::env::var("FC_ROOTFS") {
            self.rootfs_path = val;
        }
        if let Ok(val) = std::env::var("FC_WARM") {
            self.warm_default = parse_num("FC_WARM", &val)?;
        }
        if let Ok(val) = std::env::var("FC_MAX") {
            self.max_vms = parse_num("FC_MAX", &val)?;
        }
        if let Ok(val) = std::env::var("FC_BRIDGE") {
            self.bridge = val;
        }
        if let Ok(val) = std::env::var("FC_BRIDGE_CIDR") {
            self.bridge_cidr = val;
        }
        if let Ok(val) = std::env::var("FC_SUBNET_PREFIX") {
            self.subnet_prefix = val;
        }
        if let Ok(val) = std::env::var("FC_OUT_IFACE") {
            self.out_iface = val;
        }
        if let Ok(val) = std::env::var("FC_GUEST_PORT") {
            self.guest_port = parse_num("FC_GUEST_PORT", &val)?;
        }
        if let Ok(val) = std::env::var("FC_PORT") {
            self.api_port = parse_num("FC_PORT", &val)?;
        }
        if let Ok(val) = std::env::var("FC_STATE_DIR") {
            self.state_dir = val.into();
            self.db_path = self.state_dir.join("desired.db");
        }
        if let Ok(val) = std::env::var("FC_DESIRED_PATH") {
            self.desired_path = val.into();
        }
        if let Ok(val) = std::env::var("FC_DB_PATH") {
            self.db_path = val.into();
        }
        if let Ok(val) = std::env::var("FC_HEALTH_TIMEOUT_SECS") {
            self.health_timeout = Duration::from_secs(parse_num("FC_HEALTH_TIMEOUT_SECS", &val)?);
        }
        if let Ok(val) = std::env::var("FC_RECONCILE_MS") {
            self.reconcile_interval = Duration::from_millis(parse_num("FC_RECONCILE_MS", &val)?);
        }
        Ok(())
    }

    // Default value functions
    fn default_backend() -> Backend {
        if cfg!(target_os = "linux") {
            Backend::Firecracker
        } else {
            Backend::CloudHypervisor
        }
    }
    fn default_state_dir() -> PathBuf {
        "./data/fcpool".into()
    }
}

impl Default for Settings {
    fn default() -> Self {
        let state_dir = Self::default_state_dir();
        Self {
            backend: Self::default_backend(),
            kernel_path: "/var/lib/fcpool/vmlinux".into(),
            rootfs_path: "/var/lib/fcpool/rootfs.ext4".into(),
            warm_default: 1,
            max_vms: 20,
            bridge: "fcbr0".into(),
            bridge_cidr: "172.30.0.1/24".into(),
            subnet_prefix: "172.30.0".into(),
            out_iface: "eth0".into(),
            guest_port: 8080,
            api_port: 7070,
            db_path: state_dir.join("desired.db"),
            desired_path: state_dir.join("desired.json"),
            state_dir,
            firecracker_bin: "firecracker".into(),
            cloud_hypervisor_bin: "cloud-hypervisor".into(),
            boot_deadline: Duration::from_secs(60),
            health_timeout: Duration::from_secs(15),
            health_interval: Duration::from_millis(200),
            warm_timeout: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(1),
            attach_timeout: Duration::from_secs(60),
        }
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.into(),
        value: value.into(),
        reason: "expected a number".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let settings = Settings::default();
        assert_eq!(settings.db_path, settings.state_dir.join("desired.db"));
        assert!(settings.boot_deadline >= settings.health_timeout);
    }

    #[test]
    fn backend_parsing() {
        assert_eq!(Backend::parse("firecracker").unwrap(), Backend::Firecracker);
        assert_eq!(
            Backend::parse("cloud_hypervisor").unwrap(),
            Backend::CloudHypervisor
        );
        assert!(Backend::parse("qemu").is_err());
    }
}
