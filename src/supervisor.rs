// Supervision for the control plane's long-lived background tasks.
//
// The reconciler must keep ticking for the lifetime of the process; a
// panic in one tick must not silently stop convergence. Tasks registered
// here are restarted according to their strategy until shutdown. VM actors
// are transient and deliberately not supervised: a normal exit is final.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// How a supervised task is restarted after it dies.
#[derive(Debug, Clone)]
pub enum SupervisionStrategy {
    /// Restart after a fixed short pause.
    RestartAlways,
    /// Restart with exponential backoff.
    RestartWithBackoff {
        initial_delay: Duration,
        max_delay: Duration,
        factor: f64,
    },
    /// Give up after `max_restarts` failures within `within`.
    RestartLimit { max_restarts: usize, within: Duration },
}

struct SupervisedTask {
    name: String,
    strategy: SupervisionStrategy,
    shutdown_rx: watch::Receiver<bool>,
    task_fn: Arc<dyn Fn() -> JoinHandle<()> + Send + Sync>,
    restart_count: usize,
    last_restart: Option<tokio::time::Instant>,
}

impl SupervisedTask {
    async fn supervise(mut self) {
        let mut current_delay = Duration::from_secs(1);

        loop {
            if *self.shutdown_rx.borrow() {
                tracing::info!(task = %self.name, "Supervised task stopping on shutdown");
                return;
            }
            if !self.should_restart() {
                tracing::error!(
                    task = %self.name,
                    restarts = self.restart_count,
                    "Supervised task exceeded restart limit"
                );
                return;
            }

            let handle = (self.task_fn)();
            tracing::info!(task = %self.name, restart_count = self.restart_count, "Supervised task started");

            tokio::select! {
                result = handle => {
                    match result {
                        Ok(()) => {
                            tracing::warn!(task = %self.name, "Supervised task exited, restarting");
                        }
                        Err(e) if e.is_panic() => {
                            tracing::error!(task = %self.name, error = %e, "Supervised task panicked, restarting");
                        }
                        Err(e) => {
                            tracing::error!(task = %self.name, error = %e, "Supervised task failed, restarting");
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        tracing::info!(task = %self.name, "Supervised task received shutdown");
                        return;
                    }
                }
            }

            self.restart_count += 1;
            self.last_restart = Some(tokio::time::Instant::now());

            let delay = self.restart_delay(&mut current_delay);
            if delay > Duration::ZERO {
                sleep(delay).await;
            }
        }
    }

    fn should_restart(&self) -> bool {
        match &self.strategy {
            SupervisionStrategy::RestartAlways
            | SupervisionStrategy::RestartWithBackoff { .. } => true,
            SupervisionStrategy::RestartLimit {
                max_restarts,
                within,
            } => {
                if self.restart_count >= *max_restarts {
                    // The window resets once failures stop clustering.
                    if let Some(last) = self.last_restart {
                        if last.elapsed() > *within {
                            return true;
                        }
                    }
                    false
                } else {
                    true
                }
            }
        }
    }

    fn restart_delay(&self, current_delay: &mut Duration) -> Duration {
        match &self.strategy {
            SupervisionStrategy::RestartAlways | SupervisionStrategy::RestartLimit { .. } => {
                Duration::from_secs(1)
            }
            SupervisionStrategy::RestartWithBackoff {
                initial_delay,
                max_delay,
                factor,
            } => {
                let delay = if self.restart_count <= 1 {
                    *initial_delay
                } else {
                    current_delay.mul_f64(*factor).min(*max_delay)
                };
                *current_delay = delay;
                delay
            }
        }
    }
}

/// Owns the background tasks and the process-wide shutdown signal.
pub struct TaskSupervisor {
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tasks: Vec::new(),
            shutdown_tx,
        }
    }

    /// Shutdown receiver for tasks that want to exit cleanly themselves.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Register a task factory under supervision.
    pub fn supervise<F>(&mut self, name: &str, strategy: SupervisionStrategy, task_fn: F)
    where
        F: Fn() -> JoinHandle<()> + Send + Sync + 'static,
    {
        let supervised = SupervisedTask {
            name: name.to_string(),
            strategy,
            shutdown_rx: self.shutdown_tx.subscribe(),
            task_fn: Arc::new(task_fn),
            restart_count: 0,
            last_restart: None,
        };
        self.tasks.push(tokio::spawn(supervised.supervise()));
        tracing::info!(task = %name, "Task registered with supervisor");
    }

    /// Signal shutdown and wait (bounded) for every task to wind down.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.shutdown_tx
            .send(true)
            .context("Failed to send shutdown signal")?;

        for handle in self.tasks.drain(..) {
            tokio::select! {
                _ = handle => {}
                _ = sleep(Duration::from_secs(10)) => {
                    tracing::warn!("Supervised task did not shut down in time");
                }
            }
        }
        Ok(())
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn restart_always_keeps_restarting() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut supervisor = TaskSupervisor::new();
        supervisor.supervise("crashy", SupervisionStrategy::RestartAlways, move || {
            let counter = Arc::clone(&counter_clone);
            tokio::spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("boom");
            })
        });

        sleep(Duration::from_secs(3)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_limit_gives_up() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let mut supervisor = TaskSupervisor::new();
        supervisor.supervise(
            "limited",
            SupervisionStrategy::RestartLimit {
                max_restarts: 2,
                within: Duration::from_secs(60),
            },
            move || {
                let counter = Arc::clone(&counter_clone);
                tokio::spawn(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    panic!("boom");
                })
            },
        );

        sleep(Duration::from_secs(5)).await;
        // Initial run plus two restarts.
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        supervisor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_does_not_hang_on_long_tasks() {
        let mut supervisor = TaskSupervisor::new();
        supervisor.supervise("long", SupervisionStrategy::RestartAlways, || {
            tokio::spawn(async {
                sleep(Duration::from_secs(100)).await;
            })
        });

        sleep(Duration::from_millis(100)).await;
        supervisor.shutdown().await.unwrap();
    }
}
