use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};

/// The outcome of a single attempt of a [`RetryTask`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskResult {
    /// The task completed successfully.
    Done,
    /// The attempt failed and the task should run again.
    ///
    /// Carries an optional delay suggested by the task, for example from a `Retry-After` header.
    /// Without a suggestion, the executor's backoff strategy determines the delay.
    Retry(Option<Duration>),
    /// The task failed permanently and must not run again.
    Failed,
}

/// The reason why a task ended without completing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DropReason {
    /// The executor was full or shut down when the task was submitted.
    Rejected,
    /// The task asked for a retry after its last permitted attempt.
    RetriesExhausted,
    /// The executor was shut down while the task was outstanding.
    Cancelled,
}

/// A unit of work that the [`RetryingExecutor`](crate::RetryingExecutor) may attempt several times.
#[async_trait]
pub trait RetryTask: Send + 'static {
    /// Runs one attempt of the task.
    ///
    /// `attempt` is 1-based. Attempts of the same task never run concurrently.
    async fn run(&mut self, attempt: u32) -> TaskResult;

    /// Called exactly once if the task ends without reaching [`TaskResult::Done`] or
    /// [`TaskResult::Failed`].
    ///
    /// For rejected submissions, this runs synchronously on the submitting thread.
    fn dropped(&mut self, reason: DropReason) {
        let _ = reason;
    }
}

/// The lifecycle state of a submitted task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskStatus {
    /// Waiting in the queue or for a retry.
    Pending,
    /// An attempt is running.
    Running,
    /// The task completed with [`TaskResult::Done`].
    Succeeded,
    /// The task failed permanently or exhausted its retries.
    Dropped,
    /// The submission was not accepted.
    Rejected,
    /// The task was cancelled during shutdown.
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` if the task will not run anymore.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug)]
struct HandleState {
    status: Mutex<TaskStatus>,
    changed: Condvar,
    attempts: AtomicU32,
}

/// A handle to observe a task submitted to the executor.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    state: Arc<HandleState>,
}

impl TaskHandle {
    pub(crate) fn new(status: TaskStatus) -> Self {
        Self {
            state: Arc::new(HandleState {
                status: Mutex::new(status),
                changed: Condvar::new(),
                attempts: AtomicU32::new(0),
            }),
        }
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        *self.state.status.lock() = status;
        self.state.changed.notify_all();
    }

    pub(crate) fn record_attempt(&self) {
        self.state.attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current status.
    pub fn status(&self) -> TaskStatus {
        *self.state.status.lock()
    }

    /// Returns the number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.state.attempts.load(Ordering::Relaxed)
    }

    /// Returns `true` if the task was rejected or cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.status(), TaskStatus::Rejected | TaskStatus::Cancelled)
    }

    /// Returns `true` if the task reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Blocks until the task reaches a terminal status or the timeout elapses.
    ///
    /// Returns the status observed last.
    pub fn wait(&self, timeout: Duration) -> TaskStatus {
        let deadline = Instant::now() + timeout;
        let mut status = self.state.status.lock();

        while !status.is_terminal() {
            if self
                .state
                .changed
                .wait_until(&mut status, deadline)
                .timed_out()
            {
                break;
            }
        }

        *status
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_wait_times_out_while_pending() {
        let handle = TaskHandle::new(TaskStatus::Pending);
        let status = handle.wait(Duration::from_millis(10));
        assert_eq!(status, TaskStatus::Pending);
        assert!(!handle.is_finished());
    }

    #[test]
    fn test_wait_wakes_on_terminal_status() {
        let handle = TaskHandle::new(TaskStatus::Running);
        let remote = handle.clone();

        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.set_status(TaskStatus::Succeeded);
        });

        assert_eq!(handle.wait(Duration::from_secs(5)), TaskStatus::Succeeded);
        assert!(handle.is_finished());
        assert!(!handle.is_cancelled());
        setter.join().unwrap();
    }

    #[test]
    fn test_rejected_counts_as_cancelled() {
        let handle = TaskHandle::new(TaskStatus::Rejected);
        assert!(handle.is_cancelled());
        assert!(handle.is_finished());
    }
}
