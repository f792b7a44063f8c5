use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use beacon_base_schema::EventId;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::cache::EnvelopeCache;
use crate::envelope::{CONTENT_TYPE_JSON, Envelope, Item, ItemType};
use crate::hint::Hint;
use crate::http::{Transport, TransportResult};

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

pub fn event_envelope() -> Box<Envelope> {
    let mut envelope = Envelope::new(EventId::new());
    let mut item = Item::new(ItemType::Event);
    item.set_payload(CONTENT_TYPE_JSON, r#"{"message":"hello"}"#);
    envelope.add_item(item);
    envelope
}

pub fn transaction_envelope() -> Box<Envelope> {
    let mut envelope = Envelope::new(EventId::new());
    let mut item = Item::new(ItemType::Transaction);
    item.set_payload(CONTENT_TYPE_JSON, r#"{"spans":[{},{}]}"#);
    envelope.add_item(item);
    envelope
}

/// Polls `condition` until it holds. Panics after five seconds.
pub fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// A transport that replays scripted results and remembers what it was asked to send.
pub struct MockTransport {
    results: Mutex<VecDeque<TransportResult>>,
    fallback: TransportResult,
    sent: Mutex<Vec<Box<Envelope>>>,
    attempts: AtomicUsize,
    blocker: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub fn new(fallback: TransportResult) -> Self {
        Self::scripted([], fallback)
    }

    /// Returns `results` in order, then `fallback` for every further attempt.
    pub fn scripted(
        results: impl IntoIterator<Item = TransportResult>,
        fallback: TransportResult,
    ) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            fallback,
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            blocker: None,
        }
    }

    /// Makes every attempt wait for a permit of `blocker` before it completes.
    pub fn blocked_on(mut self, blocker: Arc<Semaphore>) -> Self {
        self.blocker = Some(blocker);
        self
    }

    pub fn sent(&self) -> Vec<Box<Envelope>> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Number of attempts that started, including blocked ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, envelope: &Envelope) -> TransportResult {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(ref blocker) = self.blocker {
            if let Ok(permit) = blocker.acquire().await {
                permit.forget();
            }
        }

        self.sent.lock().push(Box::new(envelope.clone()));
        self.results.lock().pop_front().unwrap_or(self.fallback)
    }
}

/// An in-memory cache that counts how it is used.
#[derive(Default)]
pub struct MemoryCache {
    envelopes: Mutex<Vec<Box<Envelope>>>,
    stores: AtomicUsize,
    discards: AtomicUsize,
}

impl MemoryCache {
    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }

    pub fn discards(&self) -> usize {
        self.discards.load(Ordering::SeqCst)
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        self.envelopes
            .lock()
            .iter()
            .map(|envelope| envelope.event_id())
            .collect()
    }
}

impl EnvelopeCache for MemoryCache {
    fn store(&self, envelope: &Envelope, _hint: &Hint) -> bool {
        self.stores.fetch_add(1, Ordering::SeqCst);

        let mut envelopes = self.envelopes.lock();
        if !envelopes
            .iter()
            .any(|cached| cached.event_id() == envelope.event_id())
        {
            envelopes.push(Box::new(envelope.clone()));
        }

        true
    }

    fn discard(&self, event_id: EventId) {
        self.discards.fetch_add(1, Ordering::SeqCst);
        self.envelopes
            .lock()
            .retain(|envelope| envelope.event_id() != event_id);
    }

    fn list(&self) -> Vec<Box<Envelope>> {
        self.envelopes.lock().clone()
    }
}
