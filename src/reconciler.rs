// The convergence loop: drive the actual VM set toward the desired set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::PoolError;
use crate::metrics;
use crate::pool::PoolManager;
use crate::spec::fingerprint;
use crate::store::DesiredStore;

pub struct Reconciler {
    store: DesiredStore,
    pool: Arc<PoolManager>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        store: DesiredStore,
        pool: Arc<PoolManager>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            pool,
            interval,
            shutdown,
        }
    }

    /// Tick until shutdown. Ticks are serial; a slow tick delays the next
    /// one rather than overlapping it.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, "Reconciler running");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        tracing::info!("Reconciler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One convergence pass. Every error is logged and retried on the
    /// next tick; nothing here is allowed to take the loop down.
    pub async fn tick(&self) {
        self.pool.reap_dead().await;

        let desired = match self.store.list().await {
            Ok(desired) => desired,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping tick, desired set unavailable");
                return;
            }
        };
        let actual = self.pool.actual_ids().await;

        for (job_id, job) in &desired {
            if actual.contains(job_id) {
                continue;
            }
            match self.pool.attach(job_id, &job.spec).await {
                Ok(info) => {
                    tracing::info!(job_id = %job_id, vm_id = %info.vm_id, "Reconciler attached job");
                }
                Err(PoolError::NoWarmVmAvailable { fingerprint }) => {
                    tracing::debug!(job_id = %job_id, fingerprint = %fingerprint, "No warm VM yet");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Attach failed");
                }
            }
        }

        for job_id in &actual {
            if !desired.contains_key(job_id) {
                self.pool.detach(job_id).await;
            }
        }

        // Warm VMs whose fingerprint left the desired set are destroyed.
        let warm_have = self.pool.warm_spec_hashes().await;
        let desired_fps: HashSet<_> = desired.values().map(|j| fingerprint(&j.spec)).collect();
        for f in &warm_have {
            if !desired_fps.contains(f) {
                self.pool.drop_warm(f).await;
            }
        }

        // One warm VM per distinct desired fingerprint with a warm policy;
        // entries sharing a fingerprint share the slot.
        let mut seen = HashSet::new();
        for job in desired.values() {
            if job.spec.warm_min() == 0 {
                continue;
            }
            let f = fingerprint(&job.spec);
            if warm_have.contains(&f) || !seen.insert(f.clone()) {
                continue;
            }
            if let Err(e) = self.pool.ensure_warm_one(&job.spec).await {
                tracing::warn!(fingerprint = %f, error = %e, "Warm ensure failed");
            }
        }

        metrics::inc_reconcile_tick();
    }
}
