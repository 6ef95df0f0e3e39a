use futures_util::FutureExt;
use std::{
    borrow::Cow,
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owns the background tasks of the process and tears them down on shutdown.
#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn push(&mut self, task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        metrics::gauge!("vynk_background_tasks").increment(1.0);
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Waits up to `grace` for each task, then aborts it.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        for task in self.tasks {
            let TaskHandle { name, mut handle } = task;
            let outcome = if grace.is_zero() {
                handle.abort();
                handle.await
            } else {
                let sleeper = tokio::time::sleep(grace);
                tokio::pin!(sleeper);
                tokio::select! {
                    res = &mut handle => res,
                    _ = &mut sleeper => {
                        handle.abort();
                        handle.await
                    }
                }
            };
            metrics::gauge!("vynk_background_tasks").decrement(1.0);
            match outcome {
                Ok(()) => debug!(task = %name, "task completed"),
                Err(err) if err.is_cancelled() => debug!(task = %name, "task aborted"),
                Err(err) => debug!(task = %name, ?err, "task exited with error"),
            }
        }
    }
}

/// Spawn a background task that restarts on panic with exponential backoff.
pub fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let name_cow = name.into();
    let name_for_task = name_cow.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms: u64 = 200;
        let window = Duration::from_secs(30);
        let mut window_start = Instant::now();
        let mut restarts_in_window: u32 = 0;
        loop {
            let result = std::panic::AssertUnwindSafe(factory()).catch_unwind().await;
            if result.is_ok() {
                debug!(task = %name_for_task, "supervised task completed normally");
                break;
            }
            let now = Instant::now();
            if now.duration_since(window_start) > window {
                window_start = now;
                restarts_in_window = 0;
            }
            restarts_in_window = restarts_in_window.saturating_add(1);
            metrics::counter!("vynk_task_restarts_total", "task" => name_for_task.to_string())
                .increment(1);
            tracing::error!(task = %name_for_task, backoff_ms, restarts_in_window, "supervised task panicked; restarting");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = backoff_ms.saturating_mul(2).min(10_000);
        }
    });
    TaskHandle::new(name_cow, handle)
}
