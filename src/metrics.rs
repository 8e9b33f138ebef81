// Prometheus metrics for the pool control plane.

use anyhow::{Context, Result};
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::sync::OnceLock;

pub static VMS_CREATED: OnceLock<IntCounter> = OnceLock::new();
pub static BOOTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new(); // labels: outcome
pub static WARM_UPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new(); // labels: outcome
pub static ATTACH_TOTAL: OnceLock<IntCounterVec> = OnceLock::new(); // labels: outcome
pub static RECONCILE_TICKS: OnceLock<IntCounter> = OnceLock::new();
pub static WARM_POOL_SIZE: OnceLock<IntGauge> = OnceLock::new();
pub static JOBS_RUNNING: OnceLock<IntGauge> = OnceLock::new();

static INIT_RESULT: OnceLock<Result<()>> = OnceLock::new();

/// Register all metrics with the default registry. Idempotent; repeated
/// calls return the first result.
pub fn init_metrics() -> Result<()> {
    match INIT_RESULT.get_or_init(init_metrics_internal) {
        Ok(()) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("Metrics initialization failed: {}", e)),
    }
}

fn init_metrics_internal() -> Result<()> {
    if VMS_CREATED.get().is_some() {
        return Ok(());
    }

    let vms_created = register_int_counter!(
        "fcpool_vms_created_total",
        "Total microVMs created by the pool"
    )
    .context("Failed to register VMS_CREATED metric")?;

    let boots_total = register_int_counter_vec!(
        "fcpool_boots_total",
        "Boot attempts by outcome",
        &["outcome"]
    )
    .context("Failed to register BOOTS_TOTAL metric")?;

    let warm_ups_total = register_int_counter_vec!(
        "fcpool_warm_ups_total",
        "Warm-up attempts by outcome",
        &["outcome"]
    )
    .context("Failed to register WARM_UPS_TOTAL metric")?;

    let attach_total = register_int_counter_vec!(
        "fcpool_attach_total",
        "Attach calls by outcome",
        &["outcome"]
    )
    .context("Failed to register ATTACH_TOTAL metric")?;

    let reconcile_ticks = register_int_counter!(
        "fcpool_reconcile_ticks_total",
        "Completed reconciler ticks"
    )
    .context("Failed to register RECONCILE_TICKS metric")?;

    let warm_pool_size = register_int_gauge!(
        "fcpool_warm_pool_size",
        "Warm VMs currently indexed by fingerprint"
    )
    .context("Failed to register WARM_POOL_SIZE metric")?;

    let jobs_running = register_int_gauge!(
        "fcpool_jobs_running",
        "Jobs currently backed by a VM"
    )
    .context("Failed to register JOBS_RUNNING metric")?;

    VMS_CREATED
        .set(vms_created)
        .map_err(|_| anyhow::anyhow!("Failed to set VMS_CREATED"))?;
    BOOTS_TOTAL
        .set(boots_total)
        .map_err(|_| anyhow::anyhow!("Failed to set BOOTS_TOTAL"))?;
    WARM_UPS_TOTAL
        .set(warm_ups_total)
        .map_err(|_| anyhow::anyhow!("Failed to set WARM_UPS_TOTAL"))?;
    ATTACH_TOTAL
        .set(attach_total)
        .map_err(|_| anyhow::anyhow!("Failed to set ATTACH_TOTAL"))?;
    RECONCILE_TICKS
        .set(reconcile_ticks)
        .map_err(|_| anyhow::anyhow!("Failed to set RECONCILE_TICKS"))?;
    WARM_POOL_SIZE
        .set(warm_pool_size)
        .map_err(|_| anyhow::anyhow!("Failed to set WARM_POOL_SIZE"))?;
    JOBS_RUNNING
        .set(jobs_running)
        .map_err(|_| anyhow::anyhow!("Failed to set JOBS_RUNNING"))?;

    Ok(())
}

/// Render the default registry in the text exposition format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_else(|_| String::new())
}

// Increment helpers so call sites do not repeat the OnceLock dance.

pub fn inc_vms_created() {
    if let Some(c) = VMS_CREATED.get() {
        c.inc();
    }
}

pub fn inc_boot(outcome: &str) {
    if let Some(c) = BOOTS_TOTAL.get() {
        c.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_warm_up(outcome: &str) {
    if let Some(c) = WARM_UPS_TOTAL.get() {
        c.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_attach(outcome: &str) {
    if let Some(c) = ATTACH_TOTAL.get() {
        c.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_reconcile_tick() {
    if let Some(c) = RECONCILE_TICKS.get() {
        c.inc();
    }
}

pub fn set_pool_gauges(jobs: usize, warm: usize) {
    if let Some(g) = JOBS_RUNNING.get() {
        g.set(jobs as i64);
    }
    if let Some(g) = WARM_POOL_SIZE.get() {
        g.set(warm as i64);
    }
}
