//! fcpool library entry point.
//!
//! A control plane for hypervisor-backed microVMs: operators declare jobs
//! in a durable desired-state store, a reconciler diffs that against the
//! live pool every tick, and a fingerprint-keyed warm pool hides boot
//! latency behind pre-booted VMs. Each microVM is owned by exactly one
//! actor task; hypervisors, host networking, and the load balancer sit
//! behind narrow traits so the core never references a concrete backend.

/// `FC_*` environment configuration.
pub mod config;
/// Hypervisor backends: Firecracker, Cloud Hypervisor, and the test mock.
pub mod driver;
/// Typed error kinds surfaced by the core.
pub mod error;
/// HTTP request handlers.
pub mod handlers;
/// Prometheus metrics registry and exposition.
pub mod metrics;
/// Host networking collaborator (TAP devices, guest addressing).
pub mod net;
/// The pool manager: job -> VM and fingerprint -> warm VM.
pub mod pool;
/// Load-balancer registration hook.
pub mod proxy;
/// The periodic convergence loop.
pub mod reconciler;
/// HTTP control API router.
pub mod server;
/// Launch specifications and fingerprints.
pub mod spec;
/// Shared state for HTTP handlers.
pub mod state;
/// Durable desired-state store and file bootstrap.
pub mod store;
/// Supervision for long-lived background tasks.
pub mod supervisor;
/// Per-VM actors.
pub mod vm;

pub use config::Settings;
pub use error::PoolError;
pub use pool::PoolManager;
pub use reconciler::Reconciler;
pub use spec::{fingerprint, Fingerprint, Spec};
pub use store::DesiredStore;
