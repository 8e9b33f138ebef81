// VM status machine: Init -> Booting -> (Running | Warm | Failed) -> Stopped.

use serde::{Deserialize, Serialize};

/// Current state of one microVM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Actor exists, nothing spawned yet.
    Init,
    /// Boot sequence in flight.
    Booting,
    /// Booted and bound (or bindable) to a tenant workload.
    Running,
    /// Booted and primed, parked in the warm pool.
    Warm,
    /// Boot or runtime failure; terminal for this instance.
    Failed,
    /// Terminated; host resources released.
    Stopped,
}

impl VmStatus {
    /// VM process is up (running or warm).
    pub fn is_up(&self) -> bool {
        matches!(self, VmStatus::Running | VmStatus::Warm)
    }

    pub fn is_warm(&self) -> bool {
        matches!(self, VmStatus::Warm)
    }

    /// No further transitions leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Failed | VmStatus::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_predicates() {
        assert!(!VmStatus::Init.is_up());
        assert!(!VmStatus::Booting.is_up());
        assert!(VmStatus::Running.is_up());
        assert!(VmStatus::Warm.is_up());
        assert!(VmStatus::Warm.is_warm());
        assert!(!VmStatus::Running.is_warm());
        assert!(VmStatus::Failed.is_terminal());
        assert!(VmStatus::Stopped.is_terminal());
        assert!(!VmStatus::Running.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&VmStatus::Warm).unwrap(), r#""warm""#);
    }
}
