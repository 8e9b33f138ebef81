// Launch specifications and their content fingerprints.
//
// A Spec is the immutable description of one microVM: images, command,
// environment, resources, lifecycle class, and warm-pool policy. Two specs
// that canonicalize to the same bytes are interchangeable, which is what
// lets the pool satisfy a job from any warm VM with the same fingerprint.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identifier of a desired job. Unique across the desired set.
pub type JobId = String;

/// Logical owner of a job. Defaults to the job id when omitted.
pub type Tenant = String;

/// Lifecycle class of a workload; governs warm-up intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Long-running service; heaviest pre-warming (replica seed + CDC).
    Service,
    /// Background daemon; lighter pre-warming.
    Daemon,
    /// One-shot job; no pre-warming.
    Job,
}

/// Guest resource sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub vcpu: u32,
    pub mem_mb: u32,
}

/// Warm-pool policy attached to a spec.
///
/// `max` defaults to `min` when the operator leaves it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmPool {
    pub min: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<u32>,
}

impl WarmPool {
    pub fn effective_max(&self) -> u32 {
        self.max.unwrap_or(self.min)
    }
}

/// Immutable launch description of one microVM.
///
/// Wire names follow the desired-state file format (`kernel`, `rootfs`);
/// unknown keys are retained in `extra` and participate in the fingerprint
/// so that forward-compatible fields still distinguish specs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    #[serde(rename = "kernel", default)]
    pub kernel_path: String,
    #[serde(rename = "rootfs", default)]
    pub rootfs_path: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub resources: Resources,
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warm_pool: Option<WarmPool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Spec {
    /// Check the semantic invariants the rest of the pool relies on.
    pub fn validate(&self) -> Result<(), String> {
        if self.kernel_path.is_empty() {
            return Err("kernel path must not be empty".into());
        }
        if self.rootfs_path.is_empty() {
            return Err("rootfs path must not be empty".into());
        }
        if self.resources.vcpu == 0 {
            return Err("resources.vcpu must be positive".into());
        }
        if self.resources.mem_mb == 0 {
            return Err("resources.mem_mb must be positive".into());
        }
        if let Some(wp) = &self.warm_pool {
            let max = wp.effective_max();
            if max == 0 && wp.min > 0 {
                return Err("warm_pool.max must be positive".into());
            }
            if max < wp.min {
                return Err("warm_pool.max must be >= warm_pool.min".into());
            }
        }
        Ok(())
    }

    /// Warm-pool minimum, zero when no policy is declared.
    pub fn warm_min(&self) -> u32 {
        self.warm_pool.map(|wp| wp.min).unwrap_or(0)
    }
}

/// Stable content hash of a [`Spec`], used as the warm-pool cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Leading slice used when deriving readable vm ids.
    pub fn short(&self) -> &str {
        &self.0[..8.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the fingerprint of a spec.
///
/// The spec is canonicalized through `serde_json::Value`, whose object map
/// keeps keys sorted, so the digest is insensitive to key order at every
/// nesting level. The digest is a 64-bit SipHash rendered as uppercase hex;
/// it is a cache key, not a security boundary.
pub fn fingerprint(spec: &Spec) -> Fingerprint {
    let value = serde_json::to_value(spec).expect("spec serializes to JSON");
    let canonical = value.to_string();
    let mut hasher = DefaultHasher::new();
    canonical.hash(&mut hasher);
    Fingerprint(format!("{:016X}", hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> Spec {
        Spec {
            kernel_path: "/images/vmlinux".into(),
            rootfs_path: "/images/rootfs.ext4".into(),
            cmd: vec!["/bin/server".into(), "--port".into(), "8080".into()],
            env: BTreeMap::from([("RUST_LOG".into(), "info".into())]),
            resources: Resources { vcpu: 2, mem_mb: 512 },
            lifecycle: Lifecycle::Service,
            warm_pool: Some(WarmPool { min: 1, max: Some(3) }),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let spec = base_spec();
        assert_eq!(fingerprint(&spec), fingerprint(&spec.clone()));
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a: Spec = serde_json::from_str(
            r#"{"kernel":"/k","rootfs":"/r","cmd":["/bin/true"],
                "env":{"B":"2","A":"1"},
                "resources":{"vcpu":1,"mem_mb":128},"lifecycle":"job"}"#,
        )
        .unwrap();
        let b: Spec = serde_json::from_str(
            r#"{"lifecycle":"job","resources":{"mem_mb":128,"vcpu":1},
                "env":{"A":"1","B":"2"},
                "cmd":["/bin/true"],"rootfs":"/r","kernel":"/k"}"#,
        )
        .unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_distinguishes_semantic_changes() {
        let spec = base_spec();
        let mut other = spec.clone();
        other.resources.mem_mb = 1024;
        assert_ne!(fingerprint(&spec), fingerprint(&other));

        let mut env_changed = spec.clone();
        env_changed.env.insert("EXTRA".into(), "1".into());
        assert_ne!(fingerprint(&spec), fingerprint(&env_changed));
    }

    #[test]
    fn fingerprint_covers_extra_fields() {
        let mut spec = base_spec();
        let plain = fingerprint(&spec);
        spec.extra
            .insert("gpu".into(), serde_json::json!({"model": "a100"}));
        assert_ne!(plain, fingerprint(&spec));
    }

    #[test]
    fn warm_pool_max_defaults_to_min() {
        let wp = WarmPool { min: 2, max: None };
        assert_eq!(wp.effective_max(), 2);
    }

    #[test]
    fn validate_rejects_bad_specs() {
        let mut spec = base_spec();
        spec.kernel_path.clear();
        assert!(spec.validate().is_err());

        let mut spec = base_spec();
        spec.resources.vcpu = 0;
        assert!(spec.validate().is_err());

        let mut spec = base_spec();
        spec.warm_pool = Some(WarmPool { min: 3, max: Some(1) });
        assert!(spec.validate().is_err());

        assert!(base_spec().validate().is_ok());
    }

    #[test]
    fn spec_roundtrips_unknown_keys() {
        let raw = r#"{"kernel":"/k","rootfs":"/r",
                      "resources":{"vcpu":1,"mem_mb":64},"lifecycle":"daemon",
                      "scheduler_hint":"numa-0"}"#;
        let spec: Spec = serde_json::from_str(raw).unwrap();
        assert_eq!(
            spec.extra.get("scheduler_hint"),
            Some(&serde_json::json!("numa-0"))
        );
    }
}
