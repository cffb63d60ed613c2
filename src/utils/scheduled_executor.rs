//! Scheduled Executor for periodic background jobs
//!
//! Drives the confidence-learner refresh on a fixed interval. Tasks are
//! idempotent and safe to cancel between steps; a failing run is logged
//! and retried at the next tick.

use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::sleep;

/// A task that runs periodically.
pub trait ScheduledTask: Send + Sync + 'static {
    /// Execute the task.
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>>;

    /// Check if the task should terminate.
    /// Default: never terminate (run forever).
    fn should_terminate(&self) -> bool {
        false
    }
}

/// Blanket implementation so Arc-wrapped tasks can be passed directly.
impl<T: ScheduledTask> ScheduledTask for Arc<T> {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        (**self).run()
    }

    fn should_terminate(&self) -> bool {
        (**self).should_terminate()
    }
}

/// Shutdown handle for a running executor.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// Scheduled executor for running periodic tasks.
pub struct ScheduledExecutor {
    interval: Duration,
    task_name: String,
    shutdown: Arc<AtomicBool>,
}

impl ScheduledExecutor {
    pub fn new(task_name: impl Into<String>, interval: Duration) -> Self {
        Self { task_name: task_name.into(), interval, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle { flag: self.shutdown.clone() }
    }

    /// Run the task on the interval until shut down or the task asks to
    /// terminate. Intended to be spawned onto the runtime.
    pub async fn start<T>(self, task: T)
    where
        T: ScheduledTask,
    {
        let task_name = self.task_name.clone();
        let interval_ms = self.interval.as_millis() as i64;
        let shutdown = self.shutdown;

        tracing::info!(
            "Starting scheduled task '{}' with interval: {:?}",
            task_name,
            self.interval
        );

        let mut next_execution = Utc::now().timestamp_millis() + interval_ms;

        loop {
            if shutdown.load(Ordering::Relaxed) || task.should_terminate() {
                tracing::info!("Scheduled task '{}' is shutting down", task_name);
                break;
            }

            let now = Utc::now().timestamp_millis();

            if now >= next_execution {
                tracing::debug!("Executing scheduled task '{}'", task_name);

                match task.run().await {
                    Ok(()) => {
                        tracing::debug!("Scheduled task '{}' completed successfully", task_name);
                    },
                    Err(e) => {
                        tracing::error!("Scheduled task '{}' failed: {}", task_name, e);
                    },
                }

                next_execution = Utc::now().timestamp_millis() + interval_ms;
            }

            let wait_ms = next_execution.saturating_sub(Utc::now().timestamp_millis());
            if wait_ms > 0 {
                sleep(Duration::from_millis(wait_ms as u64)).await;
            }
        }

        tracing::info!("Scheduled task '{}' stopped", task_name);
    }
}
