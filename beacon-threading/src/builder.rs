use std::any::Any;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use beacon_common::{BackoffStrategy, ExponentialBackoff};

use crate::executor::{CustomSpawn, DefaultSpawn, RetryingExecutor, ThreadSpawn, Worker};

/// Type alias for a thread safe closure that is used for panic handling across the code.
pub(crate) type PanicHandler = dyn Fn(Box<dyn Any + Send>) + Send + Sync;

/// [`RetryingExecutorBuilder`] configures and builds a [`RetryingExecutor`].
///
/// Besides the worker layout (threads, concurrency, naming and panic handling), the builder
/// controls the queue bound and the retry policy.
pub struct RetryingExecutorBuilder<S = DefaultSpawn> {
    pub(crate) runtime: tokio::runtime::Handle,
    pub(crate) thread_name: Option<Box<dyn FnMut(usize) -> String>>,
    pub(crate) thread_panic_handler: Option<Arc<PanicHandler>>,
    pub(crate) task_panic_handler: Option<Arc<PanicHandler>>,
    pub(crate) spawn_handler: S,
    pub(crate) num_threads: usize,
    pub(crate) max_concurrency: usize,
    pub(crate) max_queue_size: usize,
    pub(crate) max_retries: u32,
    pub(crate) backoff: Arc<dyn BackoffStrategy>,
}

impl RetryingExecutorBuilder<DefaultSpawn> {
    /// Initializes a new [`RetryingExecutorBuilder`] with default settings.
    ///
    /// Defaults to one thread running one task at a time, a queue of 30 tasks, 3 attempts per
    /// task and an exponential backoff from 1 second up to 1 minute.
    pub fn new(runtime: tokio::runtime::Handle) -> RetryingExecutorBuilder<DefaultSpawn> {
        RetryingExecutorBuilder {
            runtime,
            thread_name: None,
            thread_panic_handler: None,
            task_panic_handler: None,
            spawn_handler: DefaultSpawn,
            num_threads: 1,
            max_concurrency: 1,
            max_queue_size: 30,
            max_retries: 3,
            backoff: Arc::new(ExponentialBackoff::new(
                Duration::from_secs(1),
                Duration::from_secs(60),
            )),
        }
    }
}

impl<S> RetryingExecutorBuilder<S>
where
    S: ThreadSpawn,
{
    /// Specifies a custom naming convention for the worker threads.
    ///
    /// The provided closure receives the thread's index and returns a name.
    pub fn thread_name<F>(mut self, thread_name: F) -> Self
    where
        F: FnMut(usize) -> String + 'static,
    {
        self.thread_name = Some(Box::new(thread_name));
        self
    }

    /// Sets a custom panic handler for the worker threads.
    pub fn thread_panic_handler<F>(mut self, panic_handler: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.thread_panic_handler = Some(Arc::new(panic_handler));
        self
    }

    /// Sets a handler that observes panics of individual task attempts.
    ///
    /// Panicking attempts are always recovered and retried. The handler only receives the payload.
    pub fn task_panic_handler<F>(mut self, panic_handler: F) -> Self
    where
        F: Fn(Box<dyn Any + Send>) + Send + Sync + 'static,
    {
        self.task_panic_handler = Some(Arc::new(panic_handler));
        self
    }

    /// Configures a custom thread spawning procedure.
    pub fn spawn_handler<F>(self, spawn_handler: F) -> RetryingExecutorBuilder<CustomSpawn<F>>
    where
        F: FnMut(Worker) -> io::Result<()>,
    {
        RetryingExecutorBuilder {
            runtime: self.runtime,
            thread_name: self.thread_name,
            thread_panic_handler: self.thread_panic_handler,
            task_panic_handler: self.task_panic_handler,
            spawn_handler: CustomSpawn::new(spawn_handler),
            num_threads: self.num_threads,
            max_concurrency: self.max_concurrency,
            max_queue_size: self.max_queue_size,
            max_retries: self.max_retries,
            backoff: self.backoff,
        }
    }

    /// Sets the number of worker threads.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    /// Sets the maximum number of concurrent tasks per worker thread.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Sets the maximum number of outstanding tasks.
    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Sets the maximum number of attempts per task. At least one attempt is always made.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay strategy for retries without a suggested delay.
    pub fn backoff<B>(mut self, backoff: B) -> Self
    where
        B: BackoffStrategy + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Constructs a [`RetryingExecutor`] and spawns its worker threads.
    pub fn build(self) -> Result<RetryingExecutor, io::Error> {
        RetryingExecutor::new(self)
    }
}
