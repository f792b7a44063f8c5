use std::io;
use std::sync::Arc;
use std::time::Duration;

use beacon_base_schema::{DataCategory, DiscardReason, EventId};
use beacon_common::time::{DateProvider, SystemDateProvider};
use beacon_config::Config;
use beacon_quotas::RateLimits;
use beacon_transport::cache::{DiskEnvelopeCache, EnvelopeCache, NoOpEnvelopeCache};
use beacon_transport::client_reports::ClientReportRecorder;
use beacon_transport::connection::{AsyncConnection, AsyncConnectionBuilder};
use beacon_transport::envelope::{Envelope, Item, ItemType};
use beacon_transport::gate::{AlwaysOnGate, TransportGate};
use beacon_transport::hint::Hint;
use beacon_transport::http::{HttpError, HttpTransport, Transport};
use sentry_types::Dsn;
use serde::Serialize;

use crate::options::{
    BeforeSendEvent, BeforeSendLog, BeforeSendTransaction, ClientOptions, EventProcessor, sample,
};
use crate::protocol::{
    CheckIn, Event, ItemContainer, Level, Log, Replay, SessionStatus, SessionUpdate, TraceMetric,
    Transaction,
};

/// Content type of batched log items.
const LOG_CONTENT_TYPE: &str = "application/vnd.sentry.items.log+json";

/// Content type of batched trace metric items.
const TRACE_METRIC_CONTENT_TYPE: &str = "application/vnd.sentry.items.trace-metric+json";

/// Content type of replay recordings.
const RECORDING_CONTENT_TYPE: &str = "application/octet-stream";

type TransportFactory = Box<dyn FnOnce(Arc<RateLimits>) -> Arc<dyn Transport>>;

/// An error raised while creating a [`Client`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The HTTP transport could not be created, usually because no DSN is configured.
    #[error("failed to create transport")]
    Transport(#[from] HttpError),
    /// The cache directory could not be created.
    #[error("failed to open envelope cache")]
    Cache(#[source] io::Error),
    /// The sender threads could not be spawned.
    #[error("failed to spawn sender threads")]
    Spawn(#[source] io::Error),
}

/// Builder for [`Client`].
pub struct ClientBuilder {
    config: Config,
    options: ClientOptions,
    transport: Option<TransportFactory>,
    gate: Arc<dyn TransportGate>,
    cache: Option<Arc<dyn EnvelopeCache>>,
    date_provider: Arc<dyn DateProvider>,
}

impl ClientBuilder {
    fn new(config: Config) -> Self {
        Self {
            options: ClientOptions::from_config(&config),
            config,
            transport: None,
            gate: Arc::new(AlwaysOnGate),
            cache: None,
            date_provider: Arc::new(SystemDateProvider),
        }
    }

    /// Replaces the HTTP transport.
    ///
    /// The factory receives the rate limits of the client, which the transport must update from
    /// server responses.
    pub fn transport<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(Arc<RateLimits>) -> Arc<dyn Transport> + 'static,
    {
        self.transport = Some(Box::new(factory));
        self
    }

    /// Sets the connectivity gate.
    pub fn gate(mut self, gate: Arc<dyn TransportGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Replaces the cache selected by the configuration.
    pub fn cache(mut self, cache: Arc<dyn EnvelopeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the clock.
    pub fn date_provider(mut self, date_provider: Arc<dyn DateProvider>) -> Self {
        self.date_provider = date_provider;
        self
    }

    /// Registers a hook for error events.
    pub fn before_send<F>(mut self, hook: F) -> Self
    where
        F: Fn(Event, &Hint) -> Option<Event> + Send + Sync + 'static,
    {
        self.options.before_send = Some(Arc::new(hook) as BeforeSendEvent);
        self
    }

    /// Registers a hook for transactions.
    pub fn before_send_transaction<F>(mut self, hook: F) -> Self
    where
        F: Fn(Transaction, &Hint) -> Option<Transaction> + Send + Sync + 'static,
    {
        self.options.before_send_transaction = Some(Arc::new(hook) as BeforeSendTransaction);
        self
    }

    /// Registers a hook for log records.
    pub fn before_send_log<F>(mut self, hook: F) -> Self
    where
        F: Fn(Log) -> Option<Log> + Send + Sync + 'static,
    {
        self.options.before_send_log = Some(Arc::new(hook) as BeforeSendLog);
        self
    }

    /// Appends an event processor.
    pub fn event_processor(mut self, processor: Arc<dyn EventProcessor>) -> Self {
        self.options.event_processors.push(processor);
        self
    }

    /// Creates the client and starts its sender threads on `runtime`.
    pub fn build(self, runtime: tokio::runtime::Handle) -> Result<Client, ClientError> {
        let config = self.config;
        let date_provider = self.date_provider;

        let recorder = Arc::new(
            ClientReportRecorder::new(date_provider.clone())
                .enabled(config.send_client_reports()),
        );
        let rate_limits = Arc::new(RateLimits::new(date_provider.clone()));

        let transport = match self.transport {
            Some(factory) => factory(rate_limits.clone()),
            None => Arc::new(HttpTransport::new(&config, rate_limits.clone())?),
        };

        let cache: Arc<dyn EnvelopeCache> = match (self.cache, config.cache_dir()) {
            (Some(cache), _) => cache,
            (None, Some(dir)) => Arc::new(
                DiskEnvelopeCache::new(
                    dir,
                    config.cache_max_items(),
                    recorder.clone(),
                    date_provider.clone(),
                )
                .map_err(ClientError::Cache)?,
            ),
            (None, None) => Arc::new(NoOpEnvelopeCache),
        };

        let connection = AsyncConnectionBuilder::new(transport, rate_limits.clone(), recorder.clone())
            .configure(&config)
            .cache(cache)
            .gate(self.gate)
            .date_provider(date_provider)
            .build(runtime)
            .map_err(ClientError::Spawn)?;

        beacon_log::info!(
            environment = self.options.environment(),
            release = self.options.release(),
            "client initialized"
        );

        Ok(Client {
            options: self.options,
            dsn: config.dsn().cloned(),
            recorder,
            rate_limits,
            connection,
        })
    }
}

/// Captures telemetry and hands it to the delivery pipeline.
///
/// All capture methods are fire and forget. They return the id of the queued envelope, or `None`
/// if the data was dropped before it was queued. Every drop is counted in the client report
/// storage and reported with a later envelope.
pub struct Client {
    options: ClientOptions,
    dsn: Option<Dsn>,
    recorder: Arc<ClientReportRecorder>,
    rate_limits: Arc<RateLimits>,
    connection: AsyncConnection,
}

impl Client {
    /// Creates a client with the HTTP transport from `config`.
    pub fn new(config: Config, runtime: tokio::runtime::Handle) -> Result<Self, ClientError> {
        Self::builder(config).build(runtime)
    }

    /// Returns a builder to customize the client.
    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Returns the options of this client.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Returns the rate limits received from the server.
    pub fn rate_limits(&self) -> &Arc<RateLimits> {
        &self.rate_limits
    }

    /// Returns the recorder that counts dropped data.
    pub fn recorder(&self) -> &Arc<ClientReportRecorder> {
        &self.recorder
    }

    /// Returns `true` if envelopes are currently delivered without backpressure.
    pub fn is_healthy(&self) -> bool {
        self.connection.is_healthy()
    }

    /// Captures an error event.
    pub fn capture_event(&self, mut event: Event, hint: Hint) -> Option<EventId> {
        event.environment = event.environment.or_else(|| self.options.environment.clone());
        event.release = event.release.or_else(|| self.options.release.clone());

        let mut processed = Some(event);
        for processor in &self.options.event_processors {
            processed = processed.and_then(|event| processor.process_event(event, &hint));
        }

        let Some(event) = processed else {
            beacon_log::debug!("event dropped by event processor");
            self.recorder
                .record_lost_event(DiscardReason::EventProcessor, DataCategory::Error);
            return None;
        };

        if !sample(self.options.sample_rate) {
            beacon_log::debug!(event_id = %event.event_id, "event dropped due to sampling");
            self.recorder
                .record_lost_event(DiscardReason::SampleRate, DataCategory::Error);
            return None;
        }

        let event = match self.options.before_send {
            Some(ref before_send) => before_send(event, &hint),
            None => Some(event),
        };

        let Some(event) = event else {
            beacon_log::debug!("event dropped by before_send");
            self.recorder
                .record_lost_event(DiscardReason::BeforeSend, DataCategory::Error);
            return None;
        };

        // fatal events are persisted before the first send attempt
        let hint = if event.level == Level::Fatal {
            hint.with_crash(true)
        } else {
            hint
        };

        let item = json_item(ItemType::Event, &event)?;
        self.send_items(event.event_id, [item], hint)
    }

    /// Captures a finished transaction with its spans.
    pub fn capture_transaction(&self, mut transaction: Transaction, hint: Hint) -> Option<EventId> {
        transaction.environment = transaction
            .environment
            .or_else(|| self.options.environment.clone());
        transaction.release = transaction
            .release
            .or_else(|| self.options.release.clone());

        let span_count = transaction.spans.len();
        let mut processed = Some(transaction);
        for processor in &self.options.event_processors {
            processed =
                processed.and_then(|transaction| processor.process_transaction(transaction, &hint));
        }

        let Some(transaction) = processed else {
            beacon_log::debug!("transaction dropped by event processor");
            self.record_lost_transaction(DiscardReason::EventProcessor, span_count);
            return None;
        };

        let removed_spans = span_count.saturating_sub(transaction.spans.len());
        if removed_spans > 0 {
            self.recorder.record_lost_events(
                DiscardReason::EventProcessor,
                DataCategory::Span,
                removed_spans as u64,
            );
        }

        let span_count = transaction.spans.len();
        let sampled = transaction
            .sampled
            .unwrap_or_else(|| self.options.traces_sample_rate.is_none_or(sample));

        if !sampled {
            beacon_log::debug!(
                event_id = %transaction.event_id,
                "transaction dropped due to sampling"
            );
            self.record_lost_transaction(DiscardReason::SampleRate, span_count);
            return None;
        }

        let transaction = match self.options.before_send_transaction {
            Some(ref before_send) => before_send(transaction, &hint),
            None => Some(transaction),
        };

        let Some(transaction) = transaction else {
            beacon_log::debug!("transaction dropped by before_send_transaction");
            self.record_lost_transaction(DiscardReason::BeforeSend, span_count);
            return None;
        };

        let removed_spans = span_count.saturating_sub(transaction.spans.len());
        self.recorder.record_lost_events(
            DiscardReason::BeforeSend,
            DataCategory::Span,
            removed_spans as u64,
        );

        let item = json_item(ItemType::Transaction, &transaction)?;
        self.send_items(transaction.event_id, [item], hint)
    }

    /// Captures a cron monitor check-in.
    pub fn capture_check_in(&self, mut check_in: CheckIn) -> Option<EventId> {
        check_in.environment = check_in
            .environment
            .or_else(|| self.options.environment.clone());

        let item = json_item(ItemType::CheckIn, &check_in)?;
        self.send_items(EventId::new(), [item], Hint::new())
    }

    /// Captures a replay segment as a replay event and its recording.
    pub fn capture_replay(&self, replay: Replay, hint: Hint) -> Option<EventId> {
        let event = json_item(ItemType::ReplayEvent, &replay)?;

        let mut recording = Item::new(ItemType::ReplayRecording);
        recording.set_payload(RECORDING_CONTENT_TYPE, replay.recording);

        self.send_items(replay.replay_id, [event, recording], hint)
    }

    /// Captures a batch of log records as a single item.
    pub fn capture_logs(&self, logs: Vec<Log>) -> Option<EventId> {
        let logs: Vec<_> = match self.options.before_send_log {
            Some(ref before_send) => {
                let total = logs.len();
                let kept: Vec<_> = logs.into_iter().filter_map(|log| before_send(log)).collect();
                self.recorder.record_lost_events(
                    DiscardReason::BeforeSend,
                    DataCategory::Log,
                    (total - kept.len()) as u64,
                );
                kept
            }
            None => logs,
        };

        let item = batch_item(ItemType::Log, LOG_CONTENT_TYPE, &logs)?;
        self.send_items(EventId::new(), [item], Hint::new())
    }

    /// Captures a batch of trace metrics as a single item.
    pub fn capture_metrics(&self, metrics: Vec<TraceMetric>) -> Option<EventId> {
        let item = batch_item(ItemType::TraceMetric, TRACE_METRIC_CONTENT_TYPE, &metrics)?;
        self.send_items(EventId::new(), [item], Hint::new())
    }

    /// Captures a session update.
    ///
    /// Updates of crashed sessions are persisted before the first send attempt.
    pub fn capture_session(&self, session: SessionUpdate) -> Option<EventId> {
        let hint = Hint::new().with_crash(session.status == SessionStatus::Crashed);
        let item = json_item(ItemType::Session, &session)?;
        self.send_items(EventId::new(), [item], hint)
    }

    /// Sends a prepared envelope without further processing.
    pub fn capture_envelope(&self, envelope: Box<Envelope>, hint: Hint) -> Option<EventId> {
        let event_id = envelope.event_id();
        self.connection.send(envelope, hint);
        Some(event_id)
    }

    /// Sends the envelopes left in the durability cache by a previous run.
    pub fn send_cached(&self) {
        self.connection.send_cached();
    }

    /// Waits until all queued envelopes are processed.
    ///
    /// Without a timeout, `queue.flush_timeout` applies. Returns `false` if envelopes were still
    /// outstanding when the timeout elapsed.
    pub fn flush(&self, timeout: Option<Duration>) -> bool {
        self.connection
            .flush(timeout.unwrap_or(self.options.flush_timeout))
    }

    /// Drains the queue and stops the sender threads.
    ///
    /// Without a timeout, `queue.shutdown_timeout` applies. Envelopes still outstanding
    /// afterwards are kept in the durability cache.
    pub fn close(&self, timeout: Option<Duration>) {
        beacon_log::info!("closing client");
        self.connection
            .close(timeout.unwrap_or(self.options.shutdown_timeout));
    }

    fn record_lost_transaction(&self, reason: DiscardReason, span_count: usize) {
        self.recorder
            .record_lost_event(reason, DataCategory::Transaction);
        self.recorder
            .record_lost_events(reason, DataCategory::Span, span_count as u64);
    }

    fn send_items<const N: usize>(
        &self,
        event_id: EventId,
        items: [Item; N],
        hint: Hint,
    ) -> Option<EventId> {
        let mut envelope = Envelope::new(event_id);
        if let Some(ref dsn) = self.dsn {
            envelope.set_dsn(dsn.clone());
        }
        for item in items {
            envelope.add_item(item);
        }

        self.connection.send(envelope, hint);
        Some(event_id)
    }
}

fn json_item<T: Serialize>(ty: ItemType, value: &T) -> Option<Item> {
    match Item::from_json(ty.clone(), value) {
        Ok(item) => Some(item),
        Err(error) => {
            beacon_log::error!(
                error = &error as &dyn std::error::Error,
                item_type = %ty,
                "failed to serialize envelope item"
            );
            None
        }
    }
}

fn batch_item<T: Serialize>(ty: ItemType, content_type: &str, items: &[T]) -> Option<Item> {
    if items.is_empty() {
        return None;
    }

    let mut item = json_item(ty, &ItemContainer { items })?;
    let payload = item.payload();
    item.set_payload(content_type, payload);
    item.set_item_count(items.len() as u32);
    Some(item)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use beacon_common::time::TestDateProvider;
    use beacon_transport::client_reports::{ClientReport, DiscardedEvent};
    use beacon_transport::http::TransportResult;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::protocol::{CheckInStatus, Level, LogLevel, MetricType};

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

    /// Accepts every envelope and keeps a copy.
    #[derive(Default)]
    struct CollectingTransport {
        envelopes: Mutex<Vec<Box<Envelope>>>,
    }

    impl CollectingTransport {
        fn envelopes(&self) -> Vec<Box<Envelope>> {
            self.envelopes.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for CollectingTransport {
        async fn send(&self, envelope: &Envelope) -> TransportResult {
            self.envelopes.lock().push(Box::new(envelope.clone()));
            TransportResult::Success
        }
    }

    struct Fixture {
        runtime: tokio::runtime::Runtime,
        transport: Arc<CollectingTransport>,
    }

    impl Fixture {
        fn new() -> Self {
            beacon_log::init_test!();

            Self {
                runtime: tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(1)
                    .enable_all()
                    .build()
                    .unwrap(),
                transport: Arc::new(CollectingTransport::default()),
            }
        }

        fn builder(&self, config: serde_json::Value) -> ClientBuilder {
            let transport = self.transport.clone();
            Client::builder(Config::from_json_value(config).unwrap())
                .date_provider(Arc::new(TestDateProvider::from_millis(1_704_067_200_000)))
                .transport(move |_| transport as Arc<dyn Transport>)
        }

        fn client(&self, config: serde_json::Value) -> Client {
            self.builder(config)
                .build(self.runtime.handle().clone())
                .unwrap()
        }
    }

    fn item_types(envelope: &Envelope) -> Vec<ItemType> {
        envelope.items().map(|item| item.ty().clone()).collect()
    }

    fn lost(reason: DiscardReason, category: DataCategory, quantity: u64) -> DiscardedEvent {
        DiscardedEvent {
            reason,
            category,
            quantity,
        }
    }

    fn transaction_with_spans(count: usize) -> Transaction {
        let mut transaction = Transaction::new("/checkout", "http.server");
        for _ in 0..count {
            let span = transaction.start_child("db.query", None);
            transaction.finish_span(span);
        }
        transaction.finish();
        transaction
    }

    #[test]
    fn test_missing_dsn() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let config = Config::from_json_value(serde_json::json!({})).unwrap();

        assert!(matches!(
            Client::new(config, runtime.handle().clone()),
            Err(ClientError::Transport(HttpError::NoCredentials))
        ));
    }

    #[test]
    fn test_capture_event() {
        let fixture = Fixture::new();
        let client = fixture.client(serde_json::json!({
            "client": {
                "dsn": "https://e12d836b15bb49d7bbf99e64295d995b@sentry.example.com/42",
                "environment": "production",
            },
        }));

        let event_id = client
            .capture_event(Event::message(Level::Error, "boom"), Hint::new())
            .unwrap();
        assert!(client.flush(TIMEOUT));

        let envelopes = fixture.transport.envelopes();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].event_id(), event_id);
        assert!(envelopes[0].dsn().is_some());

        let item = envelopes[0].items().next().unwrap();
        let event: Event = serde_json::from_slice(&item.payload()).unwrap();
        assert_eq!(event.environment.as_deref(), Some("production"));
        assert_eq!(event.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_before_send_drop() {
        let fixture = Fixture::new();
        let client = fixture
            .builder(serde_json::json!({}))
            .before_send(|event, _| (event.level != Level::Debug).then_some(event))
            .build(fixture.runtime.handle().clone())
            .unwrap();

        assert!(
            client
                .capture_event(Event::message(Level::Debug, "noise"), Hint::new())
                .is_none()
        );
        assert_eq!(
            client.recorder().storage().reset_counts_and_get(),
            vec![lost(DiscardReason::BeforeSend, DataCategory::Error, 1)]
        );
    }

    #[test]
    fn test_event_processor_order() {
        struct DropAll(AtomicUsize);

        impl EventProcessor for DropAll {
            fn process_event(&self, _event: Event, _hint: &Hint) -> Option<Event> {
                self.0.fetch_add(1, Ordering::SeqCst);
                None
            }
        }

        let fixture = Fixture::new();
        let first = Arc::new(DropAll(AtomicUsize::new(0)));
        let second = Arc::new(DropAll(AtomicUsize::new(0)));
        let client = fixture
            .builder(serde_json::json!({}))
            .event_processor(first.clone())
            .event_processor(second.clone())
            .before_send(|_, _| panic!("before_send must not run"))
            .build(fixture.runtime.handle().clone())
            .unwrap();

        assert!(client.capture_event(Event::default(), Hint::new()).is_none());
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 0);
        assert_eq!(
            client.recorder().storage().reset_counts_and_get(),
            vec![lost(DiscardReason::EventProcessor, DataCategory::Error, 1)]
        );
    }

    #[test]
    fn test_sampled_out_event_is_reported_later() {
        let fixture = Fixture::new();
        let client = fixture.client(serde_json::json!({
            "client": { "sample_rate": 0.0 },
        }));

        assert!(client.capture_event(Event::default(), Hint::new()).is_none());
        assert!(client.capture_session(session()).is_some());
        assert!(client.flush(TIMEOUT));

        let envelopes = fixture.transport.envelopes();
        assert_eq!(
            item_types(&envelopes[0]),
            vec![ItemType::Session, ItemType::ClientReport]
        );

        let report = ClientReport::parse(&envelopes[0].items().last().unwrap().payload()).unwrap();
        assert_eq!(
            report.discarded_events,
            vec![lost(DiscardReason::SampleRate, DataCategory::Error, 1)]
        );
    }

    #[test]
    fn test_transaction_sampling() {
        let fixture = Fixture::new();
        let client = fixture.client(serde_json::json!({
            "client": { "traces_sample_rate": 0.0 },
        }));

        assert!(
            client
                .capture_transaction(transaction_with_spans(4), Hint::new())
                .is_none()
        );
        assert_eq!(
            client.recorder().storage().reset_counts_and_get(),
            vec![
                lost(DiscardReason::SampleRate, DataCategory::Transaction, 1),
                lost(DiscardReason::SampleRate, DataCategory::Span, 4),
            ]
        );

        let mut forced = transaction_with_spans(1);
        forced.sampled = Some(true);
        assert!(client.capture_transaction(forced, Hint::new()).is_some());
    }

    #[test]
    fn test_before_send_transaction_removes_spans() {
        let fixture = Fixture::new();
        let client = fixture
            .builder(serde_json::json!({}))
            .before_send_transaction(|mut transaction, _| {
                transaction.spans.truncate(1);
                Some(transaction)
            })
            .build(fixture.runtime.handle().clone())
            .unwrap();

        assert!(
            client
                .capture_transaction(transaction_with_spans(3), Hint::new())
                .is_some()
        );
        assert!(client.flush(TIMEOUT));

        let envelopes = fixture.transport.envelopes();
        let quantities = envelopes[0].items().next().unwrap().quantities();
        assert_eq!(
            quantities.as_slice(),
            &[(DataCategory::Transaction, 1), (DataCategory::Span, 1)]
        );
        assert_eq!(
            client.recorder().storage().reset_counts_and_get(),
            vec![lost(DiscardReason::BeforeSend, DataCategory::Span, 2)]
        );
    }

    #[test]
    fn test_event_processor_removes_spans() {
        struct KeepFirstSpan;

        impl EventProcessor for KeepFirstSpan {
            fn process_event(&self, event: Event, _hint: &Hint) -> Option<Event> {
                Some(event)
            }

            fn process_transaction(
                &self,
                mut transaction: Transaction,
                _hint: &Hint,
            ) -> Option<Transaction> {
                transaction.spans.truncate(1);
                Some(transaction)
            }
        }

        let fixture = Fixture::new();
        let client = fixture
            .builder(serde_json::json!({}))
            .event_processor(Arc::new(KeepFirstSpan))
            .build(fixture.runtime.handle().clone())
            .unwrap();

        assert!(
            client
                .capture_transaction(transaction_with_spans(3), Hint::new())
                .is_some()
        );
        assert_eq!(
            client.recorder().storage().reset_counts_and_get(),
            vec![lost(DiscardReason::EventProcessor, DataCategory::Span, 2)]
        );
    }

    /// Cache and transport calls in the order they happened.
    #[derive(Default)]
    struct CallLog(Mutex<Vec<&'static str>>);

    impl CallLog {
        fn calls(&self) -> Vec<&'static str> {
            self.0.lock().clone()
        }
    }

    impl EnvelopeCache for CallLog {
        fn store(&self, _envelope: &Envelope, _hint: &Hint) -> bool {
            self.0.lock().push("store");
            true
        }

        fn discard(&self, _event_id: EventId) {
            self.0.lock().push("discard");
        }

        fn list(&self) -> Vec<Box<Envelope>> {
            Vec::new()
        }
    }

    struct LoggingTransport(Arc<CallLog>);

    #[async_trait]
    impl Transport for LoggingTransport {
        async fn send(&self, _envelope: &Envelope) -> TransportResult {
            self.0.0.lock().push("send");
            TransportResult::Success
        }
    }

    fn logging_client(fixture: &Fixture, log: &Arc<CallLog>) -> Client {
        let transport = Arc::new(LoggingTransport(log.clone()));
        Client::builder(Config::from_json_value(serde_json::json!({})).unwrap())
            .transport(move |_| transport as Arc<dyn Transport>)
            .cache(log.clone())
            .build(fixture.runtime.handle().clone())
            .unwrap()
    }

    #[test]
    fn test_fatal_event_stored_before_send() {
        let fixture = Fixture::new();
        let log = Arc::new(CallLog::default());
        let client = logging_client(&fixture, &log);

        client.capture_event(Event::message(Level::Error, "handled"), Hint::new());
        assert!(client.flush(TIMEOUT));
        assert_eq!(log.calls(), vec!["send"]);

        client.capture_event(Event::message(Level::Fatal, "crashed"), Hint::new());
        assert!(client.flush(TIMEOUT));
        assert_eq!(log.calls(), vec!["send", "store", "send", "discard"]);
    }

    #[test]
    fn test_crashed_session_stored_before_send() {
        let fixture = Fixture::new();
        let log = Arc::new(CallLog::default());
        let client = logging_client(&fixture, &log);

        let mut crashed = session();
        crashed.status = SessionStatus::Crashed;
        client.capture_session(crashed);
        assert!(client.flush(TIMEOUT));
        assert_eq!(log.calls(), vec!["store", "send", "discard"]);
    }

    #[test]
    fn test_capture_logs() {
        let fixture = Fixture::new();
        let client = fixture
            .builder(serde_json::json!({}))
            .before_send_log(|log| (log.level != LogLevel::Trace).then_some(log))
            .build(fixture.runtime.handle().clone())
            .unwrap();

        let logs = vec![
            Log::new(LogLevel::Info, "user signed in"),
            Log::new(LogLevel::Trace, "cache lookup"),
            Log::new(LogLevel::Error, "payment failed"),
        ];
        assert!(client.capture_logs(logs).is_some());
        assert_eq!(
            client.recorder().storage().reset_counts_and_get(),
            vec![lost(DiscardReason::BeforeSend, DataCategory::Log, 1)]
        );
        assert!(client.flush(TIMEOUT));

        let envelopes = fixture.transport.envelopes();
        let item = envelopes[0].items().next().unwrap();
        assert_eq!(item.ty(), &ItemType::Log);
        assert_eq!(item.item_count(), Some(2));
        assert_eq!(item.content_type(), Some(LOG_CONTENT_TYPE));
    }

    #[test]
    fn test_capture_logs_all_dropped() {
        let fixture = Fixture::new();
        let client = fixture
            .builder(serde_json::json!({}))
            .before_send_log(|_| None)
            .build(fixture.runtime.handle().clone())
            .unwrap();

        assert!(
            client
                .capture_logs(vec![Log::new(LogLevel::Info, "hello")])
                .is_none()
        );
        assert!(fixture.transport.envelopes().is_empty());
    }

    #[test]
    fn test_capture_replay_and_check_in() {
        let fixture = Fixture::new();
        let client = fixture.client(serde_json::json!({}));

        let replay = Replay {
            segment_id: 3,
            recording: Bytes::from_static(b"\x00\x01frames"),
            ..Replay::default()
        };
        let replay_id = replay.replay_id;
        assert_eq!(client.capture_replay(replay, Hint::new()), Some(replay_id));
        assert!(
            client
                .capture_check_in(CheckIn::new("nightly", CheckInStatus::Ok))
                .is_some()
        );
        assert!(client.flush(TIMEOUT));

        let mut types: Vec<_> = fixture
            .transport
            .envelopes()
            .iter()
            .flat_map(|envelope| item_types(envelope))
            .collect();
        types.sort_by_key(|ty| ty.to_string());
        assert_eq!(
            types,
            vec![
                ItemType::CheckIn,
                ItemType::ReplayEvent,
                ItemType::ReplayRecording
            ]
        );
    }

    #[test]
    fn test_capture_metrics() {
        let fixture = Fixture::new();
        let client = fixture.client(serde_json::json!({}));

        let metric = TraceMetric {
            timestamp: chrono::Utc::now(),
            name: "queue.depth".to_owned(),
            ty: MetricType::Gauge,
            value: 12.0,
            unit: None,
            trace_id: None,
            attributes: Default::default(),
        };
        assert!(client.capture_metrics(vec![metric.clone(), metric]).is_some());
        assert!(client.capture_metrics(Vec::new()).is_none());
        assert!(client.flush(TIMEOUT));

        let envelopes = fixture.transport.envelopes();
        let item = envelopes[0].items().next().unwrap();
        assert_eq!(item.quantities().as_slice(), &[(DataCategory::TraceMetric, 2)]);
    }

    #[test]
    fn test_disk_cache_from_config() {
        let fixture = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let client = fixture
            .builder(serde_json::json!({
                "cache": { "dir": dir.path() },
            }))
            .gate(Arc::new(beacon_transport::gate::ToggleGate::new(false)))
            .build(fixture.runtime.handle().clone())
            .unwrap();

        let hint = Hint::new();
        client.capture_event(Event::default(), hint.clone());
        assert_eq!(
            hint.submission_result().wait(Duration::from_secs(5)),
            Some(false)
        );
        assert!(hint.should_retry());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        assert!(fixture.transport.envelopes().is_empty());
    }

    fn session() -> SessionUpdate {
        let now = chrono::Utc::now();
        SessionUpdate {
            session_id: uuid::Uuid::new_v4(),
            distinct_id: None,
            init: true,
            started: now,
            timestamp: now,
            status: Default::default(),
            errors: 0,
            attrs: crate::protocol::SessionAttributes {
                release: "app@1.0.0".to_owned(),
                environment: None,
            },
        }
    }
}
