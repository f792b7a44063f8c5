//! The asynchronous connection that queues envelopes and delivers them with retries.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use beacon_base_schema::DiscardReason;
use beacon_common::ExponentialBackoff;
use beacon_common::time::{DateProvider, SystemDateProvider, duration_to_millis};
use beacon_config::Config;
use beacon_quotas::RateLimits;
use beacon_threading::{
    DropReason, RetryTask, RetryingExecutor, RetryingExecutorBuilder, TaskResult,
};

use crate::cache::{EnvelopeCache, NoOpEnvelopeCache};
use crate::client_reports::ClientReportRecorder;
use crate::envelope::Envelope;
use crate::gate::{AlwaysOnGate, TransportGate};
use crate::hint::Hint;
use crate::http::{Transport, TransportResult};
use crate::utils::RateLimiter;

/// A queue rejection within this window marks the connection as unhealthy.
const RECENT_REJECTION: Duration = Duration::from_secs(2);

/// Builder for [`AsyncConnection`].
pub struct AsyncConnectionBuilder {
    transport: Arc<dyn Transport>,
    rate_limits: Arc<RateLimits>,
    recorder: Arc<ClientReportRecorder>,
    cache: Arc<dyn EnvelopeCache>,
    gate: Arc<dyn TransportGate>,
    date_provider: Arc<dyn DateProvider>,
    max_queue_size: usize,
    max_retries: u32,
    num_threads: usize,
    max_concurrency: usize,
    backoff: ExponentialBackoff,
}

impl AsyncConnectionBuilder {
    /// Creates a builder for a connection sending through `transport`.
    ///
    /// `rate_limits` must be the same instance the transport updates.
    pub fn new(
        transport: Arc<dyn Transport>,
        rate_limits: Arc<RateLimits>,
        recorder: Arc<ClientReportRecorder>,
    ) -> Self {
        Self {
            transport,
            rate_limits,
            recorder,
            cache: Arc::new(NoOpEnvelopeCache),
            gate: Arc::new(AlwaysOnGate),
            date_provider: Arc::new(SystemDateProvider),
            max_queue_size: 30,
            max_retries: 3,
            num_threads: 1,
            max_concurrency: 1,
            backoff: ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        }
    }

    /// Applies the queue settings from the configuration.
    pub fn configure(self, config: &Config) -> Self {
        self.max_queue_size(config.max_queue_size())
            .max_retries(config.max_retries())
            .num_threads(config.queue_num_threads())
            .max_concurrency(config.queue_max_concurrency())
            .backoff(ExponentialBackoff::new(
                config.initial_backoff(),
                config.max_backoff(),
            ))
    }

    /// Sets the durability cache. Defaults to [`NoOpEnvelopeCache`].
    pub fn cache(mut self, cache: Arc<dyn EnvelopeCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the connectivity gate. Defaults to [`AlwaysOnGate`].
    pub fn gate(mut self, gate: Arc<dyn TransportGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Sets the clock used for `sent_at` headers and health checks.
    pub fn date_provider(mut self, date_provider: Arc<dyn DateProvider>) -> Self {
        self.date_provider = date_provider;
        self
    }

    /// Sets the maximum number of outstanding envelopes.
    pub fn max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    /// Sets the maximum number of delivery attempts per envelope.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the number of worker threads.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Sets the number of concurrent sends per worker.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the delay between attempts.
    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Starts the worker threads on `runtime`.
    pub fn build(self, runtime: tokio::runtime::Handle) -> io::Result<AsyncConnection> {
        let executor = RetryingExecutorBuilder::new(runtime)
            .thread_name(|index| format!("beacon-sender-{index}"))
            .num_threads(self.num_threads)
            .max_concurrency(self.max_concurrency)
            .max_queue_size(self.max_queue_size)
            .max_retries(self.max_retries)
            .backoff(self.backoff)
            .build()?;

        Ok(AsyncConnection {
            executor,
            shared: Arc::new(SenderShared {
                rate_limiter: RateLimiter::new(self.rate_limits, self.recorder.clone()),
                transport: self.transport,
                recorder: self.recorder,
                cache: self.cache,
                gate: self.gate,
                date_provider: self.date_provider,
                last_rejection: AtomicI64::new(i64::MIN),
            }),
        })
    }
}

/// Queues envelopes and delivers them in the background.
///
/// Every envelope handed to [`send`](Self::send) ends in exactly one of these states:
///
///  - delivered to the server,
///  - stored in the [`EnvelopeCache`] with the hint's retry flag set,
///  - recorded as lost in the client report storage.
pub struct AsyncConnection {
    executor: RetryingExecutor,
    shared: Arc<SenderShared>,
}

impl AsyncConnection {
    /// Filters and enqueues an envelope.
    ///
    /// This never blocks. The outcome is observable through the hint's
    /// [`SubmissionResult`](crate::hint::SubmissionResult).
    pub fn send(&self, envelope: Box<Envelope>, hint: Hint) {
        let event_id = envelope.event_id();

        let Some(envelope) = self.shared.rate_limiter.filter(envelope, &hint) else {
            if hint.is_cached() {
                self.shared.cache.discard(event_id);
            }
            return;
        };

        beacon_log::trace!(%event_id, "queueing envelope");
        let handle = self.executor.submit(EnvelopeSender {
            envelope,
            hint,
            shared: self.shared.clone(),
            stored: false,
        });

        if handle.is_cancelled() {
            beacon_log::debug!(%event_id, "envelope submission rejected");
        }
    }

    /// Enqueues every envelope in the durability cache.
    pub fn send_cached(&self) {
        let envelopes = self.shared.cache.list();
        beacon_log::debug!(count = envelopes.len(), "sending cached envelopes");

        for envelope in envelopes {
            self.send(envelope, Hint::cached());
        }
    }

    /// Waits until all queued envelopes are processed.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub fn flush(&self, timeout: Duration) -> bool {
        let flushed = self.executor.wait_idle(timeout);
        if !flushed {
            beacon_log::warn!(
                outstanding = self.executor.outstanding(),
                "failed to flush envelopes in time"
            );
        }
        flushed
    }

    /// Stops accepting envelopes and drains the queue for up to `timeout`.
    ///
    /// Envelopes still outstanding afterwards are stored in the durability cache.
    pub fn close(&self, timeout: Duration) {
        self.executor.shutdown(timeout);
        self.shared.rate_limiter.rate_limits().clear_observers();
    }

    /// Returns the rate limiter applied to outgoing envelopes.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.shared.rate_limiter
    }

    /// Returns the recorder that counts lost envelopes.
    pub fn recorder(&self) -> &Arc<ClientReportRecorder> {
        &self.shared.recorder
    }

    /// Returns `true` if no rate limit is active and no envelope was rejected recently.
    pub fn is_healthy(&self) -> bool {
        !self.shared.rate_limiter.is_any_rate_limit_active() && !self.shared.rejected_recently()
    }
}

impl fmt::Debug for AsyncConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncConnection")
            .field("outstanding", &self.executor.outstanding())
            .field("rate_limiter", &self.shared.rate_limiter)
            .finish()
    }
}

struct SenderShared {
    rate_limiter: RateLimiter,
    transport: Arc<dyn Transport>,
    recorder: Arc<ClientReportRecorder>,
    cache: Arc<dyn EnvelopeCache>,
    gate: Arc<dyn TransportGate>,
    date_provider: Arc<dyn DateProvider>,
    last_rejection: AtomicI64,
}

impl SenderShared {
    fn mark_rejected(&self) {
        self.last_rejection
            .store(self.date_provider.now_millis(), Ordering::Relaxed);
    }

    fn rejected_recently(&self) -> bool {
        let last = self.last_rejection.load(Ordering::Relaxed);
        let elapsed = self.date_provider.now_millis().saturating_sub(last);
        elapsed < duration_to_millis(RECENT_REJECTION)
    }
}

/// Delivers a single envelope.
struct EnvelopeSender {
    envelope: Box<Envelope>,
    hint: Hint,
    shared: Arc<SenderShared>,
    /// A copy was written to the cache by this task.
    stored: bool,
}

impl EnvelopeSender {
    fn has_copy(&self) -> bool {
        self.stored || self.hint.is_cached()
    }

    /// Ensures a copy is in the cache. Returns `false` if none could be stored.
    fn store(&mut self) -> bool {
        if !self.has_copy() {
            self.stored = self.shared.cache.store(&self.envelope, &self.hint);
        }
        self.has_copy()
    }

    fn discard(&self) {
        if self.has_copy() {
            self.shared.cache.discard(self.envelope.event_id());
        }
    }

    /// Hands the envelope back to the caller through the cache.
    ///
    /// If there is no copy and nobody retries, the envelope is recorded as lost with `reason`.
    fn defer(&mut self, reason: DiscardReason) {
        let kept = self.store() || self.hint.is_retryable();
        if !kept {
            self.shared
                .recorder
                .record_lost_envelope(reason, &self.envelope);
        }
        self.hint.mark_failed(kept);
    }

    /// Records the envelope as it was sent and ends delivery.
    fn give_up(&self, sent: &Envelope) {
        self.discard();
        self.shared
            .recorder
            .record_lost_envelope(DiscardReason::NetworkError, sent);
        self.hint.mark_failed(false);
    }

    /// Removes items that became rate limited since the envelope was queued.
    ///
    /// Returns `false` if no item remains.
    fn apply_rate_limits(&mut self) -> bool {
        let rate_limiter = &self.shared.rate_limiter;
        if !rate_limiter.is_any_rate_limit_active() {
            return true;
        }

        match rate_limiter.filter(self.envelope.clone(), &self.hint) {
            Some(envelope) => {
                let removed = envelope.len() < self.envelope.len();
                self.envelope = envelope;
                if removed && self.stored {
                    self.stored = self.shared.cache.store(&self.envelope, &self.hint);
                }
                true
            }
            None => {
                self.discard();
                false
            }
        }
    }

    /// Puts back the counts of the client report attached to a failed attempt.
    fn restore_report(&self, sent: &Envelope) {
        for item in sent.items().skip(self.envelope.len()) {
            self.shared
                .recorder
                .record_lost_envelope_item(DiscardReason::NetworkError, item);
        }
    }
}

#[async_trait]
impl RetryTask for EnvelopeSender {
    async fn run(&mut self, attempt: u32) -> TaskResult {
        let event_id = self.envelope.event_id();

        if !self.shared.gate.is_connected() {
            beacon_log::debug!(%event_id, "transport gate closed, deferring envelope");
            self.defer(DiscardReason::CacheOverflow);
            return TaskResult::Failed;
        }

        if !self.apply_rate_limits() {
            return TaskResult::Failed;
        }

        if attempt == 1 && self.hint.is_crash() {
            self.store();
        }

        let mut envelope = self
            .shared
            .recorder
            .attach_report_to_envelope(self.envelope.clone());
        envelope.set_sent_at(self.shared.date_provider.now());

        match self.shared.transport.send(&envelope).await {
            TransportResult::Success => {
                beacon_log::trace!(%event_id, attempt, "envelope sent");
                self.discard();
                self.hint.submission_result().set(true);
                TaskResult::Done
            }
            TransportResult::Rejected { status } => {
                beacon_log::warn!(%event_id, ?status, "envelope rejected by the server");
                self.give_up(&envelope);
                TaskResult::Failed
            }
            result if self.hint.is_retryable() || self.hint.is_cached() => {
                beacon_log::debug!(%event_id, ?result, "envelope send failed, caller retries");
                self.restore_report(&envelope);
                self.store();
                self.hint.mark_failed(true);
                TaskResult::Failed
            }
            TransportResult::RateLimited { .. } => {
                beacon_log::warn!(%event_id, "envelope dropped due to rate limits");
                self.give_up(&envelope);
                TaskResult::Failed
            }
            TransportResult::Retryable {
                status,
                retry_after,
            } => {
                beacon_log::debug!(%event_id, attempt, ?status, "envelope send failed, retrying");
                self.restore_report(&envelope);
                self.store();
                TaskResult::Retry(retry_after)
            }
        }
    }

    fn dropped(&mut self, reason: DropReason) {
        let event_id = self.envelope.event_id();

        match reason {
            DropReason::Rejected => {
                beacon_log::warn!(%event_id, "send queue is full, deferring envelope");
                self.shared.mark_rejected();
                self.defer(DiscardReason::QueueOverflow);
            }
            DropReason::RetriesExhausted => {
                beacon_log::warn!(%event_id, "envelope dropped after exhausting retries");
                self.give_up(&self.envelope);
            }
            DropReason::Cancelled => {
                beacon_log::debug!(%event_id, "envelope cancelled on shutdown");
                self.store();
                self.hint.mark_failed(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use beacon_base_schema::DataCategory;
    use beacon_common::time::TestDateProvider;
    use beacon_quotas::{RATE_LIMITS_HEADER, RETRY_AFTER_HEADER};
    use similar_asserts::assert_eq;
    use tokio::sync::Semaphore;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::cache::DiskEnvelopeCache;
    use crate::client_reports::DiscardedEvent;
    use crate::envelope::ItemType;
    use crate::gate::ToggleGate;
    use crate::http::HttpTransport;
    use crate::testutils::{
        MemoryCache, MockTransport, event_envelope, runtime, transaction_envelope, wait_until,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    const RETRYABLE: TransportResult = TransportResult::Retryable {
        status: Some(503),
        retry_after: None,
    };

    struct Fixture {
        clock: Arc<TestDateProvider>,
        rate_limits: Arc<RateLimits>,
        recorder: Arc<ClientReportRecorder>,
    }

    impl Fixture {
        fn new() -> Self {
            beacon_log::init_test!();

            let clock = Arc::new(TestDateProvider::default());
            Self {
                rate_limits: Arc::new(RateLimits::new(clock.clone())),
                recorder: Arc::new(ClientReportRecorder::new(clock.clone())),
                clock,
            }
        }

        fn builder(&self, transport: Arc<dyn Transport>) -> AsyncConnectionBuilder {
            AsyncConnectionBuilder::new(transport, self.rate_limits.clone(), self.recorder.clone())
                .date_provider(self.clock.clone())
                .backoff(ExponentialBackoff::new(
                    Duration::from_millis(1),
                    Duration::from_millis(5),
                ))
        }

        fn losses(&self) -> Vec<DiscardedEvent> {
            self.recorder.storage().reset_counts_and_get()
        }
    }

    fn lost(reason: DiscardReason, category: DataCategory, quantity: u64) -> DiscardedEvent {
        DiscardedEvent {
            reason,
            category,
            quantity,
        }
    }

    #[test]
    fn test_send_success() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::new(TransportResult::Success));
        let cache = Arc::new(MemoryCache::default());
        let connection = fixture
            .builder(transport.clone())
            .cache(cache.clone())
            .build(runtime.handle().clone())
            .unwrap();

        let hint = Hint::new();
        connection.send(event_envelope(), hint.clone());

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(true));
        assert!(connection.flush(TIMEOUT));
        assert_eq!(cache.stores(), 0);
        assert!(fixture.losses().is_empty());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sent_at(), Some(fixture.clock.now()));
    }

    #[test]
    fn test_client_report_attached() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::new(TransportResult::Success));
        let connection = fixture
            .builder(transport.clone())
            .build(runtime.handle().clone())
            .unwrap();

        fixture
            .recorder
            .record_lost_event(DiscardReason::SampleRate, DataCategory::Error);

        let hint = Hint::new();
        connection.send(event_envelope(), hint.clone());
        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(true));

        let types: Vec<_> = transport.sent()[0]
            .items()
            .map(|item| item.ty().clone())
            .collect();
        assert_eq!(types, vec![ItemType::Event, ItemType::ClientReport]);
        assert!(fixture.losses().is_empty());
    }

    #[test]
    fn test_rejected_by_server() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::new(TransportResult::Rejected {
            status: Some(400),
        }));
        let connection = fixture.builder(transport).build(runtime.handle().clone()).unwrap();

        let hint = Hint::new();
        connection.send(transaction_envelope(), hint.clone());

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(false));
        assert!(!hint.should_retry());
        assert_eq!(
            fixture.losses(),
            vec![
                lost(DiscardReason::NetworkError, DataCategory::Transaction, 1),
                lost(DiscardReason::NetworkError, DataCategory::Span, 2),
            ]
        );
    }

    #[test]
    fn test_retry_then_success() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::scripted(
            [RETRYABLE],
            TransportResult::Success,
        ));
        let cache = Arc::new(MemoryCache::default());
        let connection = fixture
            .builder(transport.clone())
            .cache(cache.clone())
            .build(runtime.handle().clone())
            .unwrap();

        fixture
            .recorder
            .record_lost_event(DiscardReason::BeforeSend, DataCategory::Error);

        let hint = Hint::new();
        connection.send(event_envelope(), hint.clone());
        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(true));

        // the report of the failed attempt is sent again with the second one
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].len(), 2);
        assert_eq!(sent[1].items().last().unwrap().ty(), &ItemType::ClientReport);

        assert!(fixture.losses().is_empty());
        assert_eq!(cache.stores(), 1);
        assert_eq!(cache.discards(), 1);
        assert!(cache.event_ids().is_empty());
    }

    #[test]
    fn test_retries_exhausted() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::new(RETRYABLE));
        let cache = Arc::new(MemoryCache::default());
        let connection = fixture
            .builder(transport.clone())
            .cache(cache.clone())
            .max_retries(2)
            .build(runtime.handle().clone())
            .unwrap();

        let hint = Hint::new();
        connection.send(event_envelope(), hint.clone());

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(false));
        assert!(!hint.should_retry());
        assert_eq!(transport.sent_count(), 2);
        assert!(cache.event_ids().is_empty());
        assert_eq!(
            fixture.losses(),
            vec![lost(DiscardReason::NetworkError, DataCategory::Error, 1)]
        );
    }

    #[test]
    fn test_rate_limited_response() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::new(TransportResult::RateLimited {
            retry_after: None,
        }));
        let cache = Arc::new(MemoryCache::default());
        let connection = fixture
            .builder(transport.clone())
            .cache(cache.clone())
            .build(runtime.handle().clone())
            .unwrap();

        let hint = Hint::new();
        connection.send(event_envelope(), hint.clone());

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(false));
        assert_eq!(transport.sent_count(), 1);
        assert_eq!(cache.stores(), 0);
        assert_eq!(
            fixture.losses(),
            vec![lost(DiscardReason::NetworkError, DataCategory::Error, 1)]
        );
    }

    #[test]
    fn test_retryable_hint_is_kept() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::new(RETRYABLE));
        let cache = Arc::new(MemoryCache::default());
        let connection = fixture
            .builder(transport.clone())
            .cache(cache.clone())
            .build(runtime.handle().clone())
            .unwrap();

        let envelope = event_envelope();
        let event_id = envelope.event_id();
        let hint = Hint::new().with_retryable(true);
        connection.send(envelope, hint.clone());

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(false));
        assert!(hint.should_retry());
        assert_eq!(transport.sent_count(), 1);
        assert_eq!(cache.event_ids(), vec![event_id]);
        assert!(fixture.losses().is_empty());
    }

    /// Answers with 503 and limits errors for a minute, like a server under load.
    struct OverloadedTransport {
        rate_limits: Arc<RateLimits>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for OverloadedTransport {
        async fn send(&self, _envelope: &Envelope) -> TransportResult {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.rate_limits
                .update_retry_after_limits(Some("60:error"), None, 503);
            RETRYABLE
        }
    }

    #[test]
    fn test_retry_skips_rate_limited_items() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(OverloadedTransport {
            rate_limits: fixture.rate_limits.clone(),
            attempts: AtomicUsize::new(0),
        });
        let cache = Arc::new(MemoryCache::default());
        let connection = fixture
            .builder(transport.clone())
            .cache(cache.clone())
            .build(runtime.handle().clone())
            .unwrap();

        let hint = Hint::new();
        connection.send(event_envelope(), hint.clone());

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(false));
        assert!(connection.flush(TIMEOUT));
        assert!(!hint.should_retry());

        // the second attempt never reaches the network
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stores(), 1);
        assert!(cache.event_ids().is_empty());
        assert_eq!(
            fixture.losses(),
            vec![lost(DiscardReason::RateLimitBackoff, DataCategory::Error, 1)]
        );
    }

    #[test]
    fn test_send_after_flush_timeout() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let blocker = Arc::new(Semaphore::new(0));
        let transport = Arc::new(
            MockTransport::new(TransportResult::Success).blocked_on(blocker.clone()),
        );
        let connection = fixture
            .builder(transport.clone())
            .build(runtime.handle().clone())
            .unwrap();

        let first = Hint::new();
        connection.send(event_envelope(), first.clone());
        assert!(!connection.flush(Duration::from_millis(50)));

        let second = Hint::new();
        connection.send(event_envelope(), second.clone());
        blocker.add_permits(2);

        assert_eq!(first.submission_result().wait(TIMEOUT), Some(true));
        assert_eq!(second.submission_result().wait(TIMEOUT), Some(true));
        assert!(connection.flush(TIMEOUT));
        assert_eq!(transport.sent_count(), 2);
        assert!(fixture.losses().is_empty());
    }

    #[test]
    fn test_gate_closed() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::new(TransportResult::Success));
        let cache = Arc::new(MemoryCache::default());
        let connection = fixture
            .builder(transport.clone())
            .cache(cache.clone())
            .gate(Arc::new(ToggleGate::new(false)))
            .build(runtime.handle().clone())
            .unwrap();

        let hint = Hint::new();
        connection.send(event_envelope(), hint.clone());

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(false));
        assert!(hint.should_retry());
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(cache.event_ids().len(), 1);
        assert!(fixture.losses().is_empty());
    }

    #[test]
    fn test_gate_closed_without_cache() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::new(TransportResult::Success));
        let connection = fixture
            .builder(transport)
            .gate(Arc::new(ToggleGate::new(false)))
            .build(runtime.handle().clone())
            .unwrap();

        let hint = Hint::new();
        connection.send(event_envelope(), hint.clone());

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(false));
        assert!(!hint.should_retry());
        assert_eq!(
            fixture.losses(),
            vec![lost(DiscardReason::CacheOverflow, DataCategory::Error, 1)]
        );
    }

    #[test]
    fn test_queue_overflow() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let blocker = Arc::new(Semaphore::new(0));
        let transport = Arc::new(
            MockTransport::new(TransportResult::Success).blocked_on(blocker.clone()),
        );
        let connection = fixture
            .builder(transport.clone())
            .max_queue_size(1)
            .build(runtime.handle().clone())
            .unwrap();

        let first = Hint::new();
        connection.send(event_envelope(), first.clone());
        wait_until(|| transport.attempts() == 1);
        assert!(connection.is_healthy());

        let second = Hint::new();
        connection.send(event_envelope(), second.clone());

        // rejection happens synchronously on the calling thread
        assert_eq!(second.submission_result().get(), Some(false));
        assert!(!second.should_retry());
        assert_eq!(
            fixture.losses(),
            vec![lost(DiscardReason::QueueOverflow, DataCategory::Error, 1)]
        );
        assert!(!connection.is_healthy());

        blocker.add_permits(1);
        assert_eq!(first.submission_result().wait(TIMEOUT), Some(true));

        fixture.clock.advance(RECENT_REJECTION);
        assert!(connection.is_healthy());
    }

    #[test]
    fn test_crash_stored_before_send() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let transport = Arc::new(MockTransport::new(TransportResult::Success));
        let cache = Arc::new(MemoryCache::default());
        let connection = fixture
            .builder(transport)
            .cache(cache.clone())
            .build(runtime.handle().clone())
            .unwrap();

        let hint = Hint::new().with_crash(true);
        connection.send(event_envelope(), hint.clone());

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(true));
        assert_eq!(cache.stores(), 1);
        assert_eq!(cache.discards(), 1);
        assert!(cache.event_ids().is_empty());
    }

    #[test]
    fn test_close_caches_outstanding() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let blocker = Arc::new(Semaphore::new(0));
        let transport = Arc::new(
            MockTransport::new(TransportResult::Success).blocked_on(blocker),
        );
        let cache = Arc::new(MemoryCache::default());
        let connection = fixture
            .builder(transport)
            .cache(cache.clone())
            .build(runtime.handle().clone())
            .unwrap();

        let envelope = event_envelope();
        let event_id = envelope.event_id();
        let hint = Hint::new();
        connection.send(envelope, hint.clone());

        connection.close(Duration::from_millis(50));

        assert_eq!(hint.submission_result().wait(TIMEOUT), Some(false));
        assert!(hint.should_retry());
        assert_eq!(cache.event_ids(), vec![event_id]);
        assert!(fixture.losses().is_empty());

        // closed connections defer new envelopes right away
        let late = Hint::new();
        connection.send(event_envelope(), late.clone());
        assert_eq!(late.submission_result().get(), Some(false));
        assert!(late.should_retry());
    }

    #[test]
    fn test_send_cached() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            DiskEnvelopeCache::new(
                dir.path(),
                10,
                fixture.recorder.clone(),
                fixture.clock.clone(),
            )
            .unwrap(),
        );

        let envelope = event_envelope();
        let event_id = envelope.event_id();
        assert!(cache.store(&envelope, &Hint::new()));

        let transport = Arc::new(MockTransport::new(TransportResult::Success));
        let connection = fixture
            .builder(transport.clone())
            .cache(cache.clone())
            .build(runtime.handle().clone())
            .unwrap();

        connection.send_cached();
        assert!(connection.flush(TIMEOUT));

        assert_eq!(transport.sent()[0].event_id(), event_id);
        assert!(cache.list().is_empty());
    }

    #[test]
    fn test_rate_limited_cached_envelope_is_discarded() {
        let runtime = runtime();
        let fixture = Fixture::new();
        let cache = Arc::new(MemoryCache::default());
        let transport = Arc::new(MockTransport::new(TransportResult::Success));
        let connection = fixture
            .builder(transport.clone())
            .cache(cache.clone())
            .build(runtime.handle().clone())
            .unwrap();

        let envelope = event_envelope();
        cache.store(&envelope, &Hint::new());
        fixture
            .rate_limits
            .update_retry_after_limits(Some("60:error"), None, 429);

        connection.send_cached();

        assert_eq!(transport.sent_count(), 0);
        assert!(cache.event_ids().is_empty());
        assert_eq!(
            fixture.losses(),
            vec![lost(DiscardReason::RateLimitBackoff, DataCategory::Error, 1)]
        );
    }

    #[test]
    fn test_server_rate_limit_suppresses_sends() {
        let runtime = runtime();
        let fixture = Fixture::new();

        let server = runtime.block_on(MockServer::start());
        runtime.block_on(
            Mock::given(method("POST"))
                .respond_with(
                    ResponseTemplate::new(429)
                        .insert_header(RATE_LIMITS_HEADER, "10:transaction")
                        .insert_header(RETRY_AFTER_HEADER, "10"),
                )
                .up_to_n_times(1)
                .mount(&server),
        );
        runtime.block_on(
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200))
                .mount(&server),
        );

        let config = Config::from_json_value(serde_json::json!({
            "client": { "dsn": format!("http://public@{}/42", server.address()) },
        }))
        .unwrap();
        let transport =
            Arc::new(HttpTransport::new(&config, fixture.rate_limits.clone()).unwrap());
        let connection = fixture.builder(transport).build(runtime.handle().clone()).unwrap();

        let first = Hint::new();
        connection.send(transaction_envelope(), first.clone());
        assert_eq!(first.submission_result().wait(TIMEOUT), Some(false));
        assert!(!connection.is_healthy());

        // within the window, transactions never reach the network
        fixture.clock.advance(Duration::from_millis(9_999));
        let second = Hint::new();
        connection.send(transaction_envelope(), second.clone());
        assert_eq!(second.submission_result().get(), Some(false));

        assert_eq!(
            fixture.losses(),
            vec![
                lost(DiscardReason::NetworkError, DataCategory::Transaction, 1),
                lost(DiscardReason::NetworkError, DataCategory::Span, 2),
                lost(DiscardReason::RateLimitBackoff, DataCategory::Transaction, 1),
                lost(DiscardReason::RateLimitBackoff, DataCategory::Span, 2),
            ]
        );

        fixture.clock.advance(Duration::from_millis(1));
        let third = Hint::new();
        connection.send(transaction_envelope(), third.clone());
        assert_eq!(third.submission_result().wait(TIMEOUT), Some(true));

        let requests = runtime.block_on(server.received_requests()).unwrap();
        assert_eq!(requests.len(), 2);
    }
}
