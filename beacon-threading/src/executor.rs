use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use beacon_common::BackoffStrategy;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;

use crate::builder::{PanicHandler, RetryingExecutorBuilder};
use crate::task::{DropReason, RetryTask, TaskHandle, TaskResult, TaskStatus};

/// Time granted to cancelled tasks to run their drop hooks during shutdown.
const CANCEL_GRACE: Duration = Duration::from_millis(100);

/// State shared between the executor, its workers and all outstanding jobs.
struct Shared {
    runtime: tokio::runtime::Handle,
    tx: Mutex<Option<flume::Sender<Job>>>,
    outstanding: Mutex<usize>,
    idle: Condvar,
    accepting: AtomicBool,
    token: CancellationToken,
    max_queue_size: usize,
    max_attempts: u32,
    backoff: Arc<dyn BackoffStrategy>,
    task_panic_handler: Option<Arc<PanicHandler>>,
}

impl Shared {
    /// Reserves a slot for a new task. Returns `false` if the executor is full or closed.
    fn try_reserve(&self) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }

        let mut outstanding = self.outstanding.lock();
        if *outstanding >= self.max_queue_size {
            return false;
        }

        *outstanding += 1;
        true
    }

    /// Frees the slot of a task that reached a terminal status.
    fn release(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.outstanding.lock();

        while *outstanding > 0 {
            if self.idle.wait_until(&mut outstanding, deadline).timed_out() {
                return *outstanding == 0;
            }
        }

        true
    }

    /// Hands a job to the workers. Jobs that cannot be queued anymore are cancelled.
    fn enqueue(&self, job: Job) {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => {
                if let Err(flume::SendError(job)) = tx.send(job) {
                    drop(job);
                }
            }
            None => drop(job),
        }
    }

    /// Cancels all workers and pending retries.
    fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        self.token.cancel();
        self.tx.lock().take();
    }
}

/// A submitted task together with its bookkeeping.
///
/// Dropping a job that has not finished cancels it, so that the task's drop hook and its handle
/// are always resolved, even if the job is discarded mid-flight.
struct Job {
    task: Box<dyn RetryTask>,
    handle: TaskHandle,
    shared: Arc<Shared>,
    attempts: u32,
    finished: bool,
}

impl Job {
    fn finish(&mut self, status: TaskStatus, reason: Option<DropReason>) {
        if let Some(reason) = reason {
            self.task.dropped(reason);
        }

        self.finished = true;
        self.handle.set_status(status);
        self.shared.release();
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(TaskStatus::Cancelled, Some(DropReason::Cancelled));
        }
    }
}

/// Runs one attempt of a job and schedules the next one if needed.
async fn run_job(mut job: Job) {
    let attempt = job.attempts + 1;
    job.attempts = attempt;
    job.handle.set_status(TaskStatus::Running);
    job.handle.record_attempt();

    let outcome = AssertUnwindSafe(job.task.run(attempt)).catch_unwind().await;
    let result = match outcome {
        Ok(result) => result,
        Err(payload) => {
            beacon_log::error!(attempt, "task panicked during attempt");
            if let Some(ref panic_handler) = job.shared.task_panic_handler {
                panic_handler(payload);
            }
            TaskResult::Retry(None)
        }
    };

    match result {
        TaskResult::Done => job.finish(TaskStatus::Succeeded, None),
        TaskResult::Failed => job.finish(TaskStatus::Dropped, None),
        TaskResult::Retry(_) if attempt >= job.shared.max_attempts => {
            beacon_log::debug!(attempt, "task exhausted its retries");
            job.finish(TaskStatus::Dropped, Some(DropReason::RetriesExhausted));
        }
        TaskResult::Retry(delay) => {
            let delay = delay.unwrap_or_else(|| job.shared.backoff.delay(attempt));
            beacon_log::trace!(attempt, ?delay, "scheduling task retry");
            job.handle.set_status(TaskStatus::Pending);

            let shared = job.shared.clone();
            let token = shared.token.clone();
            shared.runtime.clone().spawn(async move {
                let cancelled = tokio::select! {
                    _ = token.cancelled() => true,
                    _ = tokio::time::sleep(delay) => false,
                };

                if cancelled {
                    drop(job);
                } else {
                    shared.enqueue(job);
                }
            });
        }
    }
}

/// A bounded executor that runs [`RetryTask`]s on dedicated worker threads.
///
/// See the [crate documentation](crate) for the execution model. Dropping the executor cancels
/// all outstanding tasks immediately; use [`shutdown`](Self::shutdown) to drain first.
pub struct RetryingExecutor {
    shared: Arc<Shared>,
}

impl RetryingExecutor {
    /// Constructs a new [`RetryingExecutor`] using the configuration of the builder.
    pub(crate) fn new<S>(mut builder: RetryingExecutorBuilder<S>) -> io::Result<Self>
    where
        S: ThreadSpawn,
    {
        let (tx, rx) = flume::unbounded();

        let shared = Arc::new(Shared {
            runtime: builder.runtime.clone(),
            tx: Mutex::new(Some(tx)),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            accepting: AtomicBool::new(true),
            token: CancellationToken::new(),
            max_queue_size: builder.max_queue_size,
            max_attempts: builder.max_retries.max(1),
            backoff: builder.backoff.clone(),
            task_panic_handler: builder.task_panic_handler.clone(),
        });

        for index in 0..builder.num_threads {
            let rx: flume::Receiver<Job> = rx.clone();
            let token = shared.token.clone();
            let max_concurrency = builder.max_concurrency;

            let worker = Worker {
                index,
                max_concurrency,
                name: builder.thread_name.as_mut().map(|f| f(index)),
                runtime: builder.runtime.clone(),
                panic_handler: builder.thread_panic_handler.clone(),
                task: async move {
                    let jobs = rx
                        .into_stream()
                        .for_each_concurrent(max_concurrency, run_job);

                    tokio::select! {
                        _ = token.cancelled() => (),
                        _ = jobs => (),
                    }
                }
                .boxed(),
            };

            if let Err(error) = builder.spawn_handler.spawn(worker) {
                shared.close();
                return Err(error);
            }
        }

        Ok(Self { shared })
    }

    /// Submits a task for execution.
    ///
    /// If the executor is full or shut down, the task's [`dropped`](RetryTask::dropped) hook runs
    /// on the calling thread and the returned handle reports [`TaskStatus::Rejected`].
    pub fn submit<T>(&self, task: T) -> TaskHandle
    where
        T: RetryTask,
    {
        self.submit_boxed(Box::new(task))
    }

    /// Submits a boxed task for execution. See [`submit`](Self::submit).
    pub fn submit_boxed(&self, mut task: Box<dyn RetryTask>) -> TaskHandle {
        if !self.shared.try_reserve() {
            beacon_log::debug!("executor queue is full, rejecting task");
            task.dropped(DropReason::Rejected);
            return TaskHandle::new(TaskStatus::Rejected);
        }

        let handle = TaskHandle::new(TaskStatus::Pending);
        self.shared.enqueue(Job {
            task,
            handle: handle.clone(),
            shared: self.shared.clone(),
            attempts: 0,
            finished: false,
        });

        handle
    }

    /// Returns the number of pending, running and retry-waiting tasks.
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.lock()
    }

    /// Returns `true` if the executor accepts new tasks.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Blocks until no task is outstanding or the timeout elapses.
    ///
    /// Returns `true` if the executor became idle. New tasks can be submitted while waiting.
    /// This must not be called from within the executor's runtime.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared.wait_idle(timeout)
    }

    /// Stops accepting tasks, waits up to `timeout` for outstanding tasks, then cancels the rest.
    ///
    /// Cancelled tasks are notified with [`DropReason::Cancelled`]. Calling this more than once
    /// has no further effect.
    pub fn shutdown(&self, timeout: Duration) {
        if !self.shared.accepting.swap(false, Ordering::AcqRel) {
            return;
        }

        beacon_log::debug!("shutting down executor");
        if !self.shared.wait_idle(timeout) {
            beacon_log::warn!(
                outstanding = self.outstanding(),
                "executor did not drain in time, cancelling remaining tasks"
            );
        }

        self.shared.close();
        self.shared.wait_idle(CANCEL_GRACE);
    }
}

impl Drop for RetryingExecutor {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for RetryingExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryingExecutor")
            .field("outstanding", &self.outstanding())
            .field("max_queue_size", &self.shared.max_queue_size)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// A dedicated worker thread of a [`RetryingExecutor`].
pub struct Worker {
    index: usize,
    max_concurrency: usize,
    name: Option<String>,
    runtime: tokio::runtime::Handle,
    panic_handler: Option<Arc<PanicHandler>>,
    task: BoxFuture<'static, ()>,
}

impl Worker {
    /// Returns the index of this worker.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the number of tasks this worker runs concurrently.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Returns the name of this worker, if one was provided.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Drives the worker's tasks until the executor shuts down.
    ///
    /// Blocks the current thread. A panic escaping the worker is passed to the thread panic
    /// handler if one is configured, and propagated otherwise.
    pub fn run(self) {
        let result =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.runtime.block_on(self.task)));

        match (self.panic_handler, result) {
            (Some(panic_handler), Err(error)) => panic_handler(error),
            (None, Err(error)) => std::panic::resume_unwind(error),
            (_, Ok(())) => {}
        }
    }
}

/// A trait for customizing how the worker threads of a [`RetryingExecutor`] are spawned.
pub trait ThreadSpawn {
    /// Spawns a new thread that calls [`Worker::run`].
    fn spawn(&mut self, worker: Worker) -> io::Result<()>;
}

/// Spawns workers on standard threads, named after [`Worker::name`].
#[derive(Clone)]
pub struct DefaultSpawn;

impl ThreadSpawn for DefaultSpawn {
    fn spawn(&mut self, worker: Worker) -> io::Result<()> {
        let mut builder = std::thread::Builder::new();
        if let Some(name) = worker.name() {
            builder = builder.name(name.to_owned());
        }
        builder.spawn(|| worker.run())?;

        Ok(())
    }
}

/// A [`ThreadSpawn`] implementation backed by a closure.
#[derive(Clone)]
pub struct CustomSpawn<B>(B);

impl<B> CustomSpawn<B> {
    /// Creates a new instance of [`CustomSpawn`] with the provided closure.
    pub fn new(spawn_handler: B) -> Self {
        CustomSpawn(spawn_handler)
    }
}

impl<B> ThreadSpawn for CustomSpawn<B>
where
    B: FnMut(Worker) -> io::Result<()>,
{
    fn spawn(&mut self, worker: Worker) -> io::Result<()> {
        self.0(worker)
    }
}
