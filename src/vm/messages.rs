// Command types delivered to a VM actor's inbox.
//
// One mpsc inbox per VM gives a total order over commands: a VM's boot
// always precedes its warm_up, which precedes any tenant update.

use tokio::sync::oneshot;

use super::VmInfo;
use crate::error::PoolError;

/// Commands accepted by a VM actor.
#[derive(Debug)]
pub enum VmCommand {
    /// Snapshot identity, status, and observer references.
    Info {
        reply: oneshot::Sender<VmInfo>,
    },
    /// Drive Init -> Booting -> Running.
    Boot {
        reply: oneshot::Sender<Result<VmInfo, PoolError>>,
    },
    /// Lifecycle priming; Running -> Warm on success.
    WarmUp {
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    /// Swap the tenant, rewire proxy registration, status -> Running.
    UpdateTenant {
        tenant: String,
        reply: oneshot::Sender<Result<VmInfo, PoolError>>,
    },
    /// Normal termination; cleanup runs before the reply.
    Stop {
        reply: oneshot::Sender<()>,
    },
}
