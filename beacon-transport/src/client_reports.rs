//! Accounting of discarded data.
//!
//! Every unit of telemetry that the pipeline drops is counted in a [`ClientReportStorage`] under
//! its [`DiscardReason`] and [`DataCategory`]. The counts are drained into a [`ClientReport`],
//! which is attached as an item to the next outgoing envelope instead of being sent on its own.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use beacon_base_schema::{DataCategory, DiscardReason};
use beacon_common::time::DateProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, Item, ItemType};

const CATEGORY_COUNT: usize = DataCategory::REPORTABLE.len();
const COUNTER_COUNT: usize = DiscardReason::ALL.len() * CATEGORY_COUNT;

/// Key of a loss counter.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ClientReportKey {
    /// Why the data was dropped.
    pub reason: DiscardReason,
    /// What kind of data was dropped.
    pub category: DataCategory,
}

impl ClientReportKey {
    /// Creates a new key.
    pub fn new(reason: DiscardReason, category: DataCategory) -> Self {
        Self { reason, category }
    }

    /// Position of the key's counter, or `None` for non-reportable categories.
    fn slot(self) -> Option<usize> {
        let category = self.category.index()?;
        Some(self.reason.index() * CATEGORY_COUNT + category)
    }
}

/// Number of units dropped for a reason and category.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct DiscardedEvent {
    /// Why the data was dropped.
    pub reason: DiscardReason,
    /// What kind of data was dropped.
    pub category: DataCategory,
    /// Number of dropped units.
    pub quantity: u64,
}

/// A snapshot of discarded data, sent as a `client_report` envelope item.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ClientReport {
    /// The time at which the report was created.
    pub timestamp: DateTime<Utc>,
    /// Discard counters.
    pub discarded_events: Vec<DiscardedEvent>,
}

impl ClientReport {
    /// Parses a client report from JSON.
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Serializes a client report into JSON.
    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Lock-free table of loss counters, one per reason and category.
///
/// Increments and drains are atomic per key. A drain running concurrently with increments never
/// loses or duplicates a count: each increment lands either in this drain or in the next one.
pub struct ClientReportStorage {
    counters: Box<[AtomicU64]>,
}

impl ClientReportStorage {
    /// Creates a table with all counters at zero.
    pub fn new() -> Self {
        Self {
            counters: (0..COUNTER_COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Adds `quantity` to the counter of `key`.
    ///
    /// Keys with a non-reportable category are ignored.
    pub fn add_count(&self, key: ClientReportKey, quantity: u64) {
        if let Some(slot) = key.slot() {
            self.counters[slot].fetch_add(quantity, Ordering::Relaxed);
        }
    }

    /// Drains all non-zero counters and resets them to zero.
    pub fn reset_counts_and_get(&self) -> Vec<DiscardedEvent> {
        let mut discarded = Vec::new();

        for reason in DiscardReason::ALL {
            for category in DataCategory::REPORTABLE {
                let Some(slot) = ClientReportKey::new(reason, category).slot() else {
                    continue;
                };

                let quantity = self.counters[slot].swap(0, Ordering::Relaxed);
                if quantity > 0 {
                    discarded.push(DiscardedEvent {
                        reason,
                        category,
                        quantity,
                    });
                }
            }
        }

        discarded
    }
}

impl Default for ClientReportStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientReportStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for reason in DiscardReason::ALL {
            for category in DataCategory::REPORTABLE {
                let key = ClientReportKey::new(reason, category);
                if let Some(slot) = key.slot() {
                    let quantity = self.counters[slot].load(Ordering::Relaxed);
                    if quantity > 0 {
                        map.entry(&format_args!("{reason}:{category}"), &quantity);
                    }
                }
            }
        }
        map.finish()
    }
}

/// Records lost envelopes, items and events, and attaches the resulting reports to envelopes.
///
/// A disabled recorder accepts all calls but neither counts nor attaches anything.
#[derive(Debug)]
pub struct ClientReportRecorder {
    storage: ClientReportStorage,
    date_provider: Arc<dyn DateProvider>,
    enabled: bool,
}

impl ClientReportRecorder {
    /// Creates an enabled recorder.
    pub fn new(date_provider: Arc<dyn DateProvider>) -> Self {
        Self {
            storage: ClientReportStorage::new(),
            date_provider,
            enabled: true,
        }
    }

    /// Enables or disables the recorder.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns `true` if losses are counted and reported.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the underlying counter table.
    pub fn storage(&self) -> &ClientReportStorage {
        &self.storage
    }

    /// Records a single lost unit of `category`.
    pub fn record_lost_event(&self, reason: DiscardReason, category: DataCategory) {
        self.record_lost_events(reason, category, 1);
    }

    /// Records `quantity` lost units of `category`.
    pub fn record_lost_events(&self, reason: DiscardReason, category: DataCategory, quantity: u64) {
        if !self.enabled || quantity == 0 {
            return;
        }

        self.storage
            .add_count(ClientReportKey::new(reason, category), quantity);
    }

    /// Records every item of a lost envelope.
    pub fn record_lost_envelope(&self, reason: DiscardReason, envelope: &Envelope) {
        if !self.enabled {
            return;
        }

        for item in envelope.items() {
            self.record_lost_envelope_item(reason, item);
        }
    }

    /// Records a single lost envelope item.
    ///
    /// A lost `client_report` item is not counted. Its counts are restored instead, so that they
    /// are sent with the next report.
    pub fn record_lost_envelope_item(&self, reason: DiscardReason, item: &Item) {
        if !self.enabled {
            return;
        }

        match item.ty() {
            ItemType::ClientReport => self.restore_counts(item),
            ItemType::Unknown(ty) => {
                beacon_log::error!(
                    item_type = ty.as_str(),
                    %reason,
                    "unable to map envelope item to a data category"
                );
            }
            _ => {
                for (category, quantity) in item.quantities() {
                    self.record_lost_events(reason, category, quantity as u64);
                }
            }
        }
    }

    fn restore_counts(&self, item: &Item) {
        match ClientReport::parse(&item.payload()) {
            Ok(report) => {
                for event in report.discarded_events {
                    self.record_lost_events(event.reason, event.category, event.quantity);
                }
            }
            Err(error) => {
                beacon_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to restore counts from a lost client report"
                );
            }
        }
    }

    /// Drains the storage into a report.
    ///
    /// Returns `None` if there is nothing to report.
    pub fn create_client_report(&self) -> Option<ClientReport> {
        if !self.enabled {
            return None;
        }

        let discarded_events = self.storage.reset_counts_and_get();
        if discarded_events.is_empty() {
            return None;
        }

        Some(ClientReport {
            timestamp: self.date_provider.now(),
            discarded_events,
        })
    }

    /// Drains the storage and appends a `client_report` item to the envelope.
    ///
    /// The envelope is returned unchanged if there is nothing to report.
    pub fn attach_report_to_envelope(&self, mut envelope: Box<Envelope>) -> Box<Envelope> {
        let Some(report) = self.create_client_report() else {
            return envelope;
        };

        match Item::from_json(ItemType::ClientReport, &report) {
            Ok(item) => envelope.add_item(item),
            Err(error) => {
                beacon_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to serialize client report"
                );
                for event in report.discarded_events {
                    self.record_lost_events(event.reason, event.category, event.quantity);
                }
            }
        }

        envelope
    }
}
