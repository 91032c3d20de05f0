//! Scheduled-task abstraction
//!
//! Debounce, flush, retry and recovery timers all go through
//! [`TaskScheduler::schedule`], so the coordination logic runs unchanged
//! against tokio's paused test clock.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Schedules futures to run after a delay
pub trait TaskScheduler: Send + Sync + std::fmt::Debug {
    /// Run `task` once `delay` has elapsed
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask;

    /// Current instant on the scheduler's clock
    fn now(&self) -> Instant;
}

/// Handle to a scheduled task
///
/// Dropping the handle leaves the task running; call [`ScheduledTask::cancel`]
/// to stop it. Cancelling a task that has already fired aborts whatever work
/// it has left.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Stop the task
    #[inline]
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Check if the task ran to completion or was cancelled
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Scheduler backed by the tokio runtime timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    /// Create scheduler
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> ScheduledTask {
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
        ScheduledTask { handle }
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn task_runs_after_delay() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let task = scheduler.schedule(
            Duration::from_millis(100),
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_runs() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let task = scheduler.schedule(
            Duration::from_millis(100),
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed(),
        );
        task.cancel();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
