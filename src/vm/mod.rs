// Per-VM actors.
//
// Each microVM is owned by exactly one actor task holding the hypervisor
// handle, the TAP, the socket paths, and the current status. All access
// goes through a cloneable [`VmHandle`].

mod actor;
mod messages;
mod status;

pub use actor::{VmActor, VmActorParams, VmRuntimeConfig};
pub use messages::VmCommand;
pub use status::VmStatus;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::PoolError;
use crate::spec::Fingerprint;

/// Observer snapshot of one VM.
#[derive(Debug, Clone, Serialize)]
pub struct VmInfo {
    pub vm_id: String,
    pub tenant: String,
    pub fingerprint: Fingerprint,
    pub status: VmStatus,
    pub guest_ip: Option<String>,
    pub guest_port: u16,
}

/// Cheap handle to a VM actor; all methods go through the serial inbox.
#[derive(Debug, Clone)]
pub struct VmHandle {
    vm_id: String,
    fingerprint: Fingerprint,
    tx: mpsc::Sender<VmCommand>,
}

impl VmHandle {
    pub(crate) fn new(vm_id: String, fingerprint: Fingerprint, tx: mpsc::Sender<VmCommand>) -> Self {
        Self {
            vm_id,
            fingerprint,
            tx,
        }
    }

    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// False once the actor task has exited (normally or not).
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    fn gone(&self) -> PoolError {
        PoolError::DriverUnreachable {
            vm_id: self.vm_id.clone(),
            reason: "vm actor exited".into(),
        }
    }

    pub async fn info(&self) -> Result<VmInfo, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VmCommand::Info { reply })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())
    }

    pub async fn boot(&self) -> Result<VmInfo, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VmCommand::Boot { reply })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn warm_up(&self) -> Result<(), PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VmCommand::WarmUp { reply })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    pub async fn update_tenant(&self, tenant: &str) -> Result<VmInfo, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VmCommand::UpdateTenant {
                tenant: tenant.to_string(),
                reply,
            })
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    /// Request normal termination and wait for cleanup to finish.
    /// Idempotent: a second call finds the inbox closed and returns.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(VmCommand::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
