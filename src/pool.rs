// Pool manager: the authority over job -> VM and fingerprint -> warm VM.
//
// Map mutations are serialized behind one async mutex. Long operations
// (boot + warm-up) never run under it: ensure_warm_one records intent in a
// pending set, releases the lock for the slow work, then re-acquires to
// commit. That keeps concurrent attach idempotent and warm creation
// at-most-one per fingerprint.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Settings;
use crate::driver::HypervisorDriver;
use crate::error::PoolError;
use crate::metrics;
use crate::net::HostNetwork;
use crate::proxy::{ProxyRegistry, WARM_SENTINEL};
use crate::spec::{fingerprint, Fingerprint, JobId, Spec};
use crate::store::DesiredStore;
use crate::vm::{VmActor, VmActorParams, VmHandle, VmInfo, VmRuntimeConfig};

/// A job's live backing VM.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub vm_id: String,
    pub fingerprint: Fingerprint,
    pub tenant: String,
}

#[derive(Debug, Clone)]
struct WarmEntry {
    vm_id: String,
    spec: Spec,
}

#[derive(Default)]
struct PoolState {
    jobs: HashMap<JobId, JobEntry>,
    warm: HashMap<Fingerprint, WarmEntry>,
    /// Fingerprints with a warm creation in flight; the lock is released
    /// while those VMs boot.
    warm_pending: HashSet<Fingerprint>,
}

/// Aggregate pool view for the stats endpoint.
#[derive(Debug, Serialize)]
pub struct PoolStats {
    pub summary: PoolSummary,
    pub jobs: Vec<JobStat>,
    pub warm_pool: Vec<WarmStat>,
}

#[derive(Debug, Serialize)]
pub struct PoolSummary {
    pub jobs: usize,
    pub warm: usize,
    pub total_vms: usize,
}

#[derive(Debug, Serialize)]
pub struct JobStat {
    pub job_id: String,
    pub vm_id: String,
    pub tenant: String,
    pub fingerprint: Fingerprint,
    pub status: Option<crate::vm::VmStatus>,
}

#[derive(Debug, Serialize)]
pub struct WarmStat {
    pub fingerprint: Fingerprint,
    pub vm_id: String,
    pub status: Option<crate::vm::VmStatus>,
}

pub struct PoolManager {
    /// Self-reference for spawning background refills from `&self`.
    self_ref: Weak<PoolManager>,
    state: Mutex<PoolState>,
    /// Live actors keyed by vm id; the union of jobs' and warm's vm ids.
    vms: DashMap<String, VmHandle>,
    store: DesiredStore,
    driver: Arc<dyn HypervisorDriver>,
    network: Arc<dyn HostNetwork>,
    proxy: Arc<dyn ProxyRegistry>,
    runtime: VmRuntimeConfig,
    max_vms: usize,
    attach_timeout: Duration,
    warm_seq: AtomicU64,
    creations: AtomicU64,
    shutting_down: AtomicBool,
}

impl PoolManager {
    pub fn new(
        store: DesiredStore,
        driver: Arc<dyn HypervisorDriver>,
        network: Arc<dyn HostNetwork>,
        proxy: Arc<dyn ProxyRegistry>,
        settings: &Settings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            state: Mutex::new(PoolState::default()),
            vms: DashMap::new(),
            store,
            driver,
            network,
            proxy,
            runtime: VmRuntimeConfig::from(settings),
            max_vms: settings.max_vms,
            attach_timeout: settings.attach_timeout,
            warm_seq: AtomicU64::new(0),
            creations: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Bind `job_id` to a VM. Idempotent: an already-attached job returns
    /// its existing VM unchanged. Without a matching warm VM this fails
    /// with `NoWarmVmAvailable` and the caller retries later.
    pub async fn attach(&self, job_id: &str, spec: &Spec) -> Result<VmInfo, PoolError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        let result = match tokio::time::timeout(self.attach_timeout, self.attach_inner(job_id, spec))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PoolError::AttachTimeout {
                job_id: job_id.to_string(),
            }),
        };
        match &result {
            Ok(_) => metrics::inc_attach("ok"),
            Err(e) => metrics::inc_attach(e.metric_label()),
        }
        result
    }

    async fn attach_inner(&self, job_id: &str, spec: &Spec) -> Result<VmInfo, PoolError> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state.jobs.get(job_id) {
            let handle = self.vms.get(&entry.vm_id).map(|e| e.value().clone());
            let vm_id = entry.vm_id.clone();
            let tenant = entry.tenant.clone();
            drop(state);
            return match handle {
                Some(handle) => {
                    let info = handle.info().await?;
                    if info.tenant != tenant {
                        // A cancelled promotion can leave the VM on the
                        // warm-sentinel tenant; repair the binding.
                        handle.update_tenant(&tenant).await
                    } else {
                        Ok(info)
                    }
                }
                None => Err(PoolError::DriverUnreachable {
                    vm_id,
                    reason: "vm missing from registry".into(),
                }),
            };
        }

        let desired = self.store.get(job_id).await?;
        let Some(desired) = desired else {
            return Err(PoolError::UnknownJob {
                job_id: job_id.to_string(),
            });
        };

        let f = fingerprint(spec);
        let Some(warm) = state.warm.remove(&f) else {
            return Err(PoolError::NoWarmVmAvailable { fingerprint: f });
        };
        let Some(handle) = self.vms.get(&warm.vm_id).map(|e| e.value().clone()) else {
            // Registry lost the actor under us; the reaper will clear the
            // residue, callers see the usual retryable miss.
            return Err(PoolError::NoWarmVmAvailable { fingerprint: f });
        };

        state.jobs.insert(
            job_id.to_string(),
            JobEntry {
                vm_id: warm.vm_id.clone(),
                fingerprint: f.clone(),
                tenant: desired.tenant.clone(),
            },
        );
        self.update_gauges(&state);
        drop(state);

        match handle.update_tenant(&desired.tenant).await {
            Ok(info) => {
                tracing::info!(
                    job_id = %job_id,
                    vm_id = %warm.vm_id,
                    tenant = %desired.tenant,
                    "Promoted warm VM to job"
                );
                if let Some(pool) = self.self_ref.upgrade() {
                    let refill = warm.spec;
                    tokio::spawn(async move {
                        if let Err(e) = pool.ensure_warm_one(&refill).await {
                            tracing::warn!(error = %e, "Warm refill after promotion failed");
                        }
                    });
                }
                Ok(info)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, vm_id = %warm.vm_id, error = %e, "Promotion failed");
                let mut state = self.state.lock().await;
                state.jobs.remove(job_id);
                self.update_gauges(&state);
                drop(state);
                self.remove_vm(&warm.vm_id).await;
                Err(e)
            }
        }
    }

    /// Unbind `job_id` and stop its VM. No-op for unknown jobs. The VM is
    /// not returned to the warm pool.
    pub async fn detach(&self, job_id: &str) {
        let entry = {
            let mut state = self.state.lock().await;
            let entry = state.jobs.remove(job_id);
            self.update_gauges(&state);
            entry
        };
        if let Some(entry) = entry {
            tracing::info!(job_id = %job_id, vm_id = %entry.vm_id, "Detaching job");
            self.remove_vm(&entry.vm_id).await;
        }
    }

    /// Guarantee one warm VM for this spec's fingerprint. No-op when one
    /// exists or is already being created; failures are retried by the
    /// reconciler on its next tick.
    pub async fn ensure_warm_one(&self, spec: &Spec) -> Result<(), PoolError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }
        let f = fingerprint(spec);
        {
            let mut state = self.state.lock().await;
            if state.warm.contains_key(&f) || state.warm_pending.contains(&f) {
                return Ok(());
            }
            if self.vms.len() >= self.max_vms {
                tracing::warn!(
                    fingerprint = %f,
                    max_vms = self.max_vms,
                    "Pool at capacity, deferring warm creation"
                );
                return Ok(());
            }
            state.warm_pending.insert(f.clone());
        }

        let result = self.create_warm_vm(&f, spec).await;

        let mut state = self.state.lock().await;
        state.warm_pending.remove(&f);
        match result {
            Ok(vm_id) => {
                tracing::info!(fingerprint = %f, vm_id = %vm_id, "Warm VM ready");
                state.warm.insert(
                    f,
                    WarmEntry {
                        vm_id,
                        spec: spec.clone(),
                    },
                );
                self.update_gauges(&state);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_warm_vm(&self, f: &Fingerprint, spec: &Spec) -> Result<String, PoolError> {
        // Warm vm ids stay readable in logs: fingerprint prefix plus a
        // monotonic counter.
        let seq = self.warm_seq.fetch_add(1, Ordering::SeqCst);
        let vm_id = format!("{}-{}", f.short(), seq);

        let handle = VmActor::spawn(VmActorParams {
            vm_id: vm_id.clone(),
            fingerprint: f.clone(),
            tenant: WARM_SENTINEL.to_string(),
            spec: spec.clone(),
            driver: Arc::clone(&self.driver),
            network: Arc::clone(&self.network),
            proxy: Arc::clone(&self.proxy),
            runtime: self.runtime.clone(),
        });
        self.vms.insert(vm_id.clone(), handle.clone());
        self.creations.fetch_add(1, Ordering::SeqCst);
        metrics::inc_vms_created();

        if let Err(e) = handle.boot().await {
            self.remove_vm(&vm_id).await;
            return Err(e);
        }
        if let Err(e) = handle.warm_up().await {
            self.remove_vm(&vm_id).await;
            return Err(e);
        }
        Ok(vm_id)
    }

    async fn remove_vm(&self, vm_id: &str) {
        if let Some((_, handle)) = self.vms.remove(vm_id) {
            handle.stop().await;
        }
    }

    /// Destroy the warm VM for a fingerprint that is no longer desired.
    pub async fn drop_warm(&self, f: &Fingerprint) {
        let entry = {
            let mut state = self.state.lock().await;
            let entry = state.warm.remove(f);
            self.update_gauges(&state);
            entry
        };
        if let Some(entry) = entry {
            tracing::info!(fingerprint = %f, vm_id = %entry.vm_id, "Dropping undesired warm VM");
            self.remove_vm(&entry.vm_id).await;
        }
    }

    /// Handle of a live VM actor, if the registry still holds it.
    pub fn vm(&self, vm_id: &str) -> Option<VmHandle> {
        self.vms.get(vm_id).map(|e| e.value().clone())
    }

    /// Drop mappings whose actor has died or reached a terminal state, so
    /// the reconciler sees those jobs as unbacked and re-attaches them.
    pub async fn reap_dead(&self) {
        let handles: Vec<VmHandle> = self.vms.iter().map(|e| e.value().clone()).collect();
        let mut dead = Vec::new();
        for handle in handles {
            if !handle.is_alive() {
                dead.push(handle.vm_id().to_string());
                continue;
            }
            match handle.info().await {
                Ok(info) if info.status.is_terminal() => dead.push(info.vm_id),
                Err(_) => dead.push(handle.vm_id().to_string()),
                Ok(_) => {}
            }
        }
        if dead.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock().await;
            state.jobs.retain(|_, e| !dead.contains(&e.vm_id));
            state.warm.retain(|_, e| !dead.contains(&e.vm_id));
            self.update_gauges(&state);
        }
        for vm_id in &dead {
            tracing::warn!(vm_id = %vm_id, "Reaping dead VM");
            self.remove_vm(vm_id).await;
        }
    }

    /// Job ids currently backed by a VM.
    pub async fn actual_ids(&self) -> HashSet<JobId> {
        self.state.lock().await.jobs.keys().cloned().collect()
    }

    /// Fingerprints currently holding a warm VM.
    pub async fn warm_spec_hashes(&self) -> HashSet<Fingerprint> {
        self.state.lock().await.warm.keys().cloned().collect()
    }

    /// True when any warm VM is parked in the pool.
    pub async fn has_warm(&self) -> bool {
        !self.state.lock().await.warm.is_empty()
    }

    pub async fn lookup(&self, job_id: &str) -> Option<VmInfo> {
        let vm_id = {
            let state = self.state.lock().await;
            match state.jobs.get(job_id) {
                Some(entry) => entry.vm_id.clone(),
                None => return None,
            }
        };
        let handle = self.vms.get(&vm_id).map(|e| e.value().clone())?;
        handle.info().await.ok()
    }

    pub async fn stats(&self) -> PoolStats {
        let (jobs, warm) = {
            let state = self.state.lock().await;
            (
                state
                    .jobs
                    .iter()
                    .map(|(id, e)| (id.clone(), e.clone()))
                    .collect::<Vec<_>>(),
                state
                    .warm
                    .iter()
                    .map(|(f, e)| (f.clone(), e.vm_id.clone()))
                    .collect::<Vec<_>>(),
            )
        };

        let mut job_stats = Vec::with_capacity(jobs.len());
        for (job_id, entry) in jobs {
            let status = match self.vms.get(&entry.vm_id).map(|e| e.value().clone()) {
                Some(handle) => handle.info().await.ok().map(|i| i.status),
                None => None,
            };
            job_stats.push(JobStat {
                job_id,
                vm_id: entry.vm_id,
                tenant: entry.tenant,
                fingerprint: entry.fingerprint,
                status,
            });
        }

        let mut warm_stats = Vec::with_capacity(warm.len());
        for (f, vm_id) in warm {
            let status = match self.vms.get(&vm_id).map(|e| e.value().clone()) {
                Some(handle) => handle.info().await.ok().map(|i| i.status),
                None => None,
            };
            warm_stats.push(WarmStat {
                fingerprint: f,
                vm_id,
                status,
            });
        }

        PoolStats {
            summary: PoolSummary {
                jobs: job_stats.len(),
                warm: warm_stats.len(),
                total_vms: self.vms.len(),
            },
            jobs: job_stats,
            warm_pool: warm_stats,
        }
    }

    /// Total VM creations since start; test observability.
    pub fn vm_creations(&self) -> u64 {
        self.creations.load(Ordering::SeqCst)
    }

    /// Stop every VM in jobs and warm. Further attach/warm calls fail
    /// with `ShuttingDown`.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock().await;
            state.jobs.clear();
            state.warm.clear();
            state.warm_pending.clear();
            self.update_gauges(&state);
        }

        let vm_ids: Vec<String> = self.vms.iter().map(|e| e.key().clone()).collect();
        tracing::info!(count = vm_ids.len(), "Stopping all pool VMs");
        for vm_id in vm_ids {
            self.remove_vm(&vm_id).await;
        }
    }

    fn update_gauges(&self, state: &PoolState) {
        metrics::set_pool_gauges(state.jobs.len(), state.warm.len());
    }
}
