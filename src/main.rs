use std::sync::Arc;

use anyhow::Context;

use fcpool::config::Settings;
use fcpool::metrics;
use fcpool::net::BridgedNetwork;
use fcpool::pool::PoolManager;
use fcpool::proxy::LoggingProxy;
use fcpool::reconciler::Reconciler;
use fcpool::server::build_router;
use fcpool::state::AppState;
use fcpool::store::{bootstrap_from_file, DesiredStore};
use fcpool::supervisor::{SupervisionStrategy, TaskSupervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let settings = Settings::load()?;
    std::fs::create_dir_all(&settings.state_dir)
        .with_context(|| format!("creating state dir {}", settings.state_dir.display()))?;
    tracing::info!(
        backend = ?settings.backend,
        state_dir = %settings.state_dir.display(),
        "fcpool starting"
    );

    let store = DesiredStore::open(&settings.db_path)?;

    // Seed the desired set in the background; the reconciler tolerates a
    // store that is still populating.
    {
        let store = store.clone();
        let path = settings.desired_path.clone();
        let kernel = settings.kernel_path.clone();
        let rootfs = settings.rootfs_path.clone();
        tokio::spawn(async move {
            bootstrap_from_file(&store, &path, &kernel, &rootfs).await;
        });
    }

    let driver = fcpool::driver::for_backend(&settings);
    let network = Arc::new(BridgedNetwork::new(&settings.bridge, &settings.subnet_prefix));
    let proxy = Arc::new(LoggingProxy);
    let pool = PoolManager::new(store.clone(), driver, network, proxy, &settings);

    let mut supervisor = TaskSupervisor::new();
    {
        let store = store.clone();
        let pool = Arc::clone(&pool);
        let interval = settings.reconcile_interval;
        let shutdown = supervisor.subscribe();
        supervisor.supervise(
            "reconciler",
            SupervisionStrategy::RestartWithBackoff {
                initial_delay: std::time::Duration::from_secs(1),
                max_delay: std::time::Duration::from_secs(30),
                factor: 2.0,
            },
            move || {
                let reconciler =
                    Reconciler::new(store.clone(), Arc::clone(&pool), interval, shutdown.clone());
                tokio::spawn(reconciler.run())
            },
        );
    }

    let state = AppState::new(store, Arc::clone(&pool));
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", settings.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(addr = %addr, "Control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("control API server failed")?;

    tracing::info!("Shutting down");
    supervisor.shutdown().await?;
    pool.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install SIGINT handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
