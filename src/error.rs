// Error kinds surfaced by the pool core.

use thiserror::Error;

use crate::spec::Fingerprint;

/// Errors produced by the pool manager, the store, and the VM actors.
///
/// Per-VM failures are terminal for that vm id only; the pool and the
/// reconciler carry on. Store failures bubble to the HTTP boundary.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Attach found no warm VM for the spec's fingerprint. Recoverable;
    /// the reconciler retries on its next tick.
    #[error("no warm vm available for fingerprint {fingerprint}")]
    NoWarmVmAvailable { fingerprint: Fingerprint },

    /// The referenced job id is not in the desired set.
    #[error("unknown job '{job_id}'")]
    UnknownJob { job_id: String },

    /// Boot failed at some stage (tap, spawn, configure, start, health).
    /// Fatal for that VM instance, non-fatal for the pool.
    #[error("vm {vm_id} failed to boot during {stage}: {reason}")]
    BootFailed {
        vm_id: String,
        stage: String,
        reason: String,
    },

    /// Lifecycle pre-warming failed; the VM is still running but is not
    /// usable as a warm pool entry.
    #[error("vm {vm_id} failed to warm up: {reason}")]
    WarmUpFailed { vm_id: String, reason: String },

    /// The desired-state store could not serve the request.
    #[error("desired-state store unavailable: {0}")]
    StoreUnavailable(String),

    /// The hypervisor API socket timed out or refused the connection.
    #[error("hypervisor unreachable for vm {vm_id}: {reason}")]
    DriverUnreachable { vm_id: String, reason: String },

    /// The attach call exceeded its overall deadline.
    #[error("attach for job '{job_id}' timed out")]
    AttachTimeout { job_id: String },

    /// The pool is tearing down and refuses new work.
    #[error("pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    /// Label used for the attach outcome metric.
    pub fn metric_label(&self) -> &'static str {
        match self {
            PoolError::NoWarmVmAvailable { .. } => "no_warm",
            PoolError::UnknownJob { .. } => "unknown_job",
            PoolError::BootFailed { .. } => "boot_failed",
            PoolError::WarmUpFailed { .. } => "warm_up_failed",
            PoolError::StoreUnavailable(_) => "store_unavailable",
            PoolError::DriverUnreachable { .. } => "driver_unreachable",
            PoolError::AttachTimeout { .. } => "timeout",
            PoolError::ShuttingDown => "shutting_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = PoolError::NoWarmVmAvailable {
            fingerprint: Fingerprint("ABCD1234".into()),
        };
        assert!(err.to_string().contains("ABCD1234"));

        let err = PoolError::BootFailed {
            vm_id: "vm-1".into(),
            stage: "health".into(),
            reason: "no answer".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("vm-1") && msg.contains("health"));
    }

    #[test]
    fn metric_labels_are_distinct_per_kind() {
        let labels = [
            PoolError::NoWarmVmAvailable {
                fingerprint: Fingerprint("F".into()),
            }
            .metric_label(),
            PoolError::UnknownJob { job_id: "j".into() }.metric_label(),
            PoolError::StoreUnavailable("io".into()).metric_label(),
            PoolError::ShuttingDown.metric_label(),
        ];
        let unique: std::collections::HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), labels.len());
    }
}
