//! # Beacon Threading
//!
//! A bounded executor that delivers work with retries. Envelopes handed to the transport are
//! wrapped in a [`RetryTask`] and submitted to a [`RetryingExecutor`], which:
//!
//! - **Bounds the queue**: at most `max_queue_size` tasks are outstanding. Pending tasks, running
//!   tasks and tasks waiting for a retry all count. Further submissions are rejected immediately
//!   and the task is notified through [`RetryTask::dropped`].
//! - **Retries with backoff**: a task that asks for a retry is scheduled again after its suggested
//!   delay or the configured [`BackoffStrategy`](beacon_common::BackoffStrategy). Each task makes at
//!   most `max_retries` attempts.
//! - **Recovers from panics**: a panic inside a task is caught, logged, and treated as a failed
//!   attempt.
//! - **Shuts down within a deadline**: [`RetryingExecutor::shutdown`] drains outstanding work for
//!   a bounded time and then cancels the rest.
//!
//! ## Concurrency Model
//!
//! The executor maintains a set of dedicated worker threads. Each of them drives futures on a
//! shared tokio runtime and runs up to `max_concurrency` tasks concurrently. Attempts of a single
//! task never overlap.
//!
//! ## Usage Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use beacon_threading::{RetryTask, RetryingExecutorBuilder, TaskResult};
//!
//! struct Ping;
//!
//! #[async_trait]
//! impl RetryTask for Ping {
//!     async fn run(&mut self, _attempt: u32) -> TaskResult {
//!         TaskResult::Done
//!     }
//! }
//!
//! let runtime = tokio::runtime::Builder::new_multi_thread()
//!     .enable_all()
//!     .build()
//!     .unwrap();
//!
//! let executor = RetryingExecutorBuilder::new(runtime.handle().clone())
//!     .num_threads(2)
//!     .max_queue_size(30)
//!     .build()
//!     .expect("failed to build executor");
//!
//! let handle = executor.submit(Ping);
//! assert!(!handle.is_cancelled());
//! executor.shutdown(std::time::Duration::from_secs(1));
//! ```

#![warn(missing_docs)]

mod builder;
mod executor;
mod task;

pub use self::builder::*;
pub use self::executor::*;
pub use self::task::*;
