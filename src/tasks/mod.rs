use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};

pub mod deduplication;
pub mod pending_expiry;

pub use deduplication::{deduplicate_attachments, AttachmentDeduplicationTask};
pub use pending_expiry::{expire_pending_attachments, PendingUploadExpiryTask};

pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Trait that all background tasks implement
pub trait Task: Send + Sync {
    /// The name of the task (for logging)
    fn name(&self) -> &'static str;

    /// How often this task should run
    fn interval(&self) -> Duration;

    /// Execute one pass - returns a boxed future to keep the trait dyn-compatible
    fn execute(&self) -> TaskFuture<'_>;
}

/// Runs every registered task on its own timer. The first tick fires immediately.
#[derive(Clone)]
pub struct TaskScheduler {
    tasks: Arc<RwLock<Vec<Arc<dyn Task>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: Arc::new(RwLock::new(Vec::new())),
            shutdown: Arc::new(shutdown),
        }
    }

    pub async fn register_task(&self, task: Arc<dyn Task>) {
        log::info!("Registering task: {} (every {:?})", task.name(), task.interval());
        self.tasks.write().await.push(task);
    }

    /// Runs until `stop` is called.
    pub async fn start(&self) {
        log::info!("Starting task scheduler...");

        let tasks = self.tasks.read().await.clone();
        let mut handles = Vec::new();

        for task in tasks {
            let mut stopped = self.shutdown.subscribe();

            handles.push(tokio::spawn(async move {
                let mut timer = interval(task.interval());
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

                while !*stopped.borrow() {
                    tokio::select! {
                        _ = timer.tick() => {}
                        _ = stopped.changed() => break,
                    }

                    run_once(task.as_ref()).await;
                }

                log::info!("Task {} stopped", task.name());
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                log::error!("Task loop aborted: {e}");
            }
        }
    }

    pub fn stop(&self) {
        log::info!("Stopping task scheduler...");
        self.shutdown.send_replace(true);
    }
}

/// Executes one pass, logging the outcome. A failed pass never ends the schedule.
pub async fn run_once(task: &dyn Task) -> bool {
    let started = Instant::now();
    log::debug!("Executing task: {}", task.name());

    match task.execute().await {
        Ok(()) => {
            log::debug!("Task {} completed in {:?}", task.name(), started.elapsed());
            true
        }
        Err(e) => {
            log::error!("Task {} failed: {e:#}", task.name());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Task for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(20)
        }

        fn execute(&self) -> TaskFuture<'_> {
            Box::pin(async move {
                self.runs.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err(anyhow!("boom"))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn test_failing_task_keeps_running_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = TaskScheduler::new();
        scheduler
            .register_task(Arc::new(Counting {
                runs: runs.clone(),
                fail: true,
            }))
            .await;

        let running = scheduler.clone();
        let handle = tokio::spawn(async move { running.start().await });

        tokio::time::sleep(Duration::from_millis(110)).await;
        scheduler.stop();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap();

        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_run_once_reports_outcome() {
        let runs = Arc::new(AtomicUsize::new(0));

        assert!(
            run_once(&Counting {
                runs: runs.clone(),
                fail: false
            })
            .await
        );
        assert!(
            !run_once(&Counting {
                runs: runs.clone(),
                fail: true
            })
            .await
        );
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
