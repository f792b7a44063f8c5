//! Per-envelope hints passed alongside an envelope through the pipeline.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Outcome of a submission that a caller can wait for.
///
/// The result is set once, when the envelope's delivery reached a terminal state. Clones share
/// the same state.
#[derive(Clone, Default)]
pub struct SubmissionResult {
    inner: Arc<(Mutex<Option<bool>>, Condvar)>,
}

impl SubmissionResult {
    /// Creates a new, unresolved submission result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the result and wakes up all waiters.
    pub fn set(&self, success: bool) {
        let (result, changed) = &*self.inner;
        *result.lock() = Some(success);
        changed.notify_all();
    }

    /// Returns the result, if it has been set.
    pub fn get(&self) -> Option<bool> {
        *self.inner.0.lock()
    }

    /// Blocks until the result is set or the timeout elapses.
    pub fn wait(&self, timeout: Duration) -> Option<bool> {
        let (result, changed) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut guard = result.lock();

        while guard.is_none() {
            if changed.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }

        *guard
    }
}

impl fmt::Debug for SubmissionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SubmissionResult").field(&self.get()).finish()
    }
}

/// Contextual information about an envelope that is not part of its payload.
///
/// Hints control how the pipeline treats an envelope:
///
/// - **Retryable**: the caller retries delivery on its own, for example from the disk cache.
///   Rate limited and failed items are then not recorded as lost.
/// - **Cached**: the envelope was read back from the durability cache and must not be stored
///   again.
/// - **Crash**: the envelope contains a crash and is persisted before the first network attempt.
///
/// The `retry` flag and the [`SubmissionResult`] are shared between clones, so that the caller
/// can observe what the pipeline decided after handing the hint over.
#[derive(Clone, Default)]
pub struct Hint {
    retryable: bool,
    cached: bool,
    crash: bool,
    retry: Arc<AtomicBool>,
    result: SubmissionResult,
    extras: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
}

impl Hint {
    /// Creates an empty hint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hint for an envelope read back from the durability cache.
    ///
    /// Cached envelopes are not retryable: items dropped by rate limits are removed from the
    /// cache and therefore recorded as lost.
    pub fn cached() -> Self {
        Self {
            cached: true,
            ..Self::default()
        }
    }

    /// Marks the envelope as retried by the caller.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Marks the envelope as containing a crash.
    pub fn with_crash(mut self, crash: bool) -> Self {
        self.crash = crash;
        self
    }

    /// Attaches a named value that event processors can inspect.
    pub fn with_extra<T>(mut self, name: impl Into<String>, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.extras.insert(name.into(), Arc::new(value));
        self
    }

    /// Returns `true` if the caller retries delivery on its own.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Returns `true` if the envelope was read from the durability cache.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Returns `true` if the envelope contains a crash.
    pub fn is_crash(&self) -> bool {
        self.crash
    }

    /// Returns `true` if the pipeline asked the caller to retry this envelope.
    pub fn should_retry(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// Sets the shared retry flag.
    pub fn set_retry(&self, retry: bool) {
        self.retry.store(retry, Ordering::Release);
    }

    /// Returns the shared submission result.
    pub fn submission_result(&self) -> &SubmissionResult {
        &self.result
    }

    /// Returns the named extra if it exists and has type `T`.
    pub fn get_extra<T>(&self, name: &str) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.extras.get(name)?.downcast_ref()
    }

    /// Marks the delivery as failed and sets whether the caller should retry it.
    pub(crate) fn mark_failed(&self, retry: bool) {
        self.result.set(false);
        self.set_retry(retry);
    }
}

impl fmt::Debug for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hint")
            .field("retryable", &self.retryable)
            .field("cached", &self.cached)
            .field("crash", &self.crash)
            .field("retry", &self.should_retry())
            .field("result", &self.result)
            .field("extras", &self.extras.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_retry_flag_is_shared() {
        let hint = Hint::new().with_retryable(true);
        let clone = hint.clone();

        clone.mark_failed(true);

        assert!(hint.should_retry());
        assert_eq!(hint.submission_result().get(), Some(false));
    }

    #[test]
    fn test_cached_hint() {
        let hint = Hint::cached();
        assert!(hint.is_cached());
        assert!(!hint.is_retryable());
        assert!(!hint.is_crash());
    }

    #[test]
    fn test_typed_extras() {
        let hint = Hint::new().with_extra("response", 404u16);

        assert_eq!(hint.get_extra::<u16>("response"), Some(&404));
        assert_eq!(hint.get_extra::<String>("response"), None);
        assert_eq!(hint.get_extra::<u16>("request"), None);
    }

    #[test]
    fn test_wait_for_submission_result() {
        let hint = Hint::new();
        assert_eq!(
            hint.submission_result().wait(Duration::from_millis(10)),
            None
        );

        let result = hint.submission_result().clone();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            result.set(true);
        });

        assert_eq!(
            hint.submission_result().wait(Duration::from_secs(5)),
            Some(true)
        );
        setter.join().unwrap();
    }

    #[test]
    fn test_debug() {
        let hint = Hint::new().with_crash(true).with_extra("request", ());
        insta::assert_debug_snapshot!(hint, @r###"
        Hint {
            retryable: false,
            cached: false,
            crash: true,
            retry: false,
            result: SubmissionResult(
                None,
            ),
            extras: [
                "request",
            ],
        }
        "###);
    }
}
