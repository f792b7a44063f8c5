use std::fmt;
use std::sync::Arc;

use beacon_base_schema::{DataCategory, DiscardReason};
use beacon_quotas::RateLimits;

use crate::client_reports::ClientReportRecorder;
use crate::envelope::{Envelope, Item};
use crate::hint::Hint;

/// Returns the category that decides whether an item is rate limited.
///
/// Items without a category, such as client reports, are only affected by a limit on all
/// categories.
pub fn item_category(item: &Item) -> DataCategory {
    item.quantities()
        .first()
        .map_or(DataCategory::Unknown, |(category, _)| *category)
}

/// Removes rate limited items from envelopes before they are sent.
pub struct RateLimiter {
    rate_limits: Arc<RateLimits>,
    recorder: Arc<ClientReportRecorder>,
}

impl RateLimiter {
    /// Creates a filter on top of the shared rate limit state.
    pub fn new(rate_limits: Arc<RateLimits>, recorder: Arc<ClientReportRecorder>) -> Self {
        Self {
            rate_limits,
            recorder,
        }
    }

    /// Returns the shared rate limit state.
    pub fn rate_limits(&self) -> &Arc<RateLimits> {
        &self.rate_limits
    }

    /// Returns `true` if the given category is currently rate limited.
    pub fn is_active_for_category(&self, category: DataCategory) -> bool {
        self.rate_limits.is_active_for_category(category)
    }

    /// Returns `true` if any category is currently rate limited.
    pub fn is_any_rate_limit_active(&self) -> bool {
        self.rate_limits.is_any_rate_limit_active()
    }

    /// Removes all items whose category is currently rate limited.
    ///
    /// Removed items are recorded as lost with [`DiscardReason::RateLimitBackoff`], unless the
    /// hint is retryable. Returns `None` if no item remains. In this case, the hint's submission
    /// result is marked as failed and the caller is told not to retry.
    pub fn filter(&self, mut envelope: Box<Envelope>, hint: &Hint) -> Option<Box<Envelope>> {
        let limited = envelope
            .take_items_by(|item| self.rate_limits.is_active_for_category(item_category(item)));

        if limited.is_empty() {
            return Some(envelope);
        }

        beacon_log::warn!(
            event_id = %envelope.event_id(),
            dropped = limited.len(),
            "envelope items dropped due to rate limits"
        );

        if !hint.is_retryable() {
            for item in &limited {
                self.recorder
                    .record_lost_envelope_item(DiscardReason::RateLimitBackoff, item);
            }
        }

        if envelope.is_empty() {
            beacon_log::warn!(
                event_id = %envelope.event_id(),
                "envelope discarded because all items are rate limited"
            );
            hint.mark_failed(false);
            return None;
        }

        Some(envelope)
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("rate_limits", &self.rate_limits)
            .finish()
    }
}
