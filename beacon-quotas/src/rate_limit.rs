use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::Duration;

use beacon_base_schema::DataCategory;
use beacon_common::time::{DateProvider, duration_to_millis, millis_to_date_time};
use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;

/// Name of the rate limits header.
pub const RATE_LIMITS_HEADER: &str = "X-Sentry-Rate-Limits";

/// Name of the standard HTTP retry header.
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// The delay applied when a rate limit does not specify a valid delay.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Number of deadline slots: one per reportable category and one for [`DataCategory::All`].
const SLOT_COUNT: usize = DataCategory::REPORTABLE.len() + 1;
const ALL_SLOT: usize = DataCategory::REPORTABLE.len();

/// A relative delay after which a rate limit expires.
///
/// Parsed from the decimal number of seconds used in both `Retry-After` and
/// `X-Sentry-Rate-Limits`. Fractions are kept with millisecond precision, and negative values are
/// treated as zero.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RetryAfter(Duration);

impl RetryAfter {
    /// Creates a retry after instance.
    #[inline]
    pub fn from_secs(seconds: u64) -> Self {
        Self(Duration::from_secs(seconds))
    }

    /// Returns the delay until the rate limit expires.
    #[inline]
    pub fn delay(self) -> Duration {
        self.0
    }

    /// Parses an optional header value, falling back to [`DEFAULT_RETRY_AFTER`].
    pub fn parse_or_default(value: Option<&str>) -> Self {
        value
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(Self(DEFAULT_RETRY_AFTER))
    }
}

/// Error parsing a `RetryAfter`.
#[derive(Debug, thiserror::Error)]
pub enum InvalidRetryAfter {
    /// The supplied delay in seconds was not valid.
    #[error("invalid delay")]
    InvalidDelay(#[from] std::num::ParseFloatError),
    /// The supplied delay is not a finite number.
    #[error("delay out of range")]
    OutOfRange,
}

impl FromStr for RetryAfter {
    type Err = InvalidRetryAfter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let float = s.parse::<f64>()?;
        if !float.is_finite() {
            return Err(InvalidRetryAfter::OutOfRange);
        }

        let millis = (float.max(0.0) * 1000.0) as u64;
        Ok(Self(Duration::from_millis(millis)))
    }
}

/// A set of data categories.
pub type DataCategories = SmallVec<[DataCategory; 8]>;

/// A single entry of the `X-Sentry-Rate-Limits` header.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimit {
    /// The categories listed in the entry.
    ///
    /// Empty if the limit applies to all categories. Names that are not understood are kept as
    /// [`DataCategory::Unknown`] and never limited.
    pub categories: DataCategories,
    /// The delay until the limit expires.
    pub retry_after: RetryAfter,
}

/// Parses the `X-Sentry-Rate-Limits` header.
///
/// The header is a comma separated list of `seconds:categories:scope:reason_code:namespaces`
/// entries. Only seconds and categories are used. Entries without a category field are skipped,
/// and an invalid number of seconds falls back to [`DEFAULT_RETRY_AFTER`].
pub fn parse_rate_limits(string: &str) -> Vec<RateLimit> {
    let mut rate_limits = Vec::new();

    for limit in string.split(',') {
        let limit: String = limit.chars().filter(|c| !c.is_whitespace()).collect();
        if limit.is_empty() {
            continue;
        }

        let mut components = limit.split(':');
        let retry_after = RetryAfter::parse_or_default(components.next());

        let Some(categories) = components.next() else {
            continue;
        };

        let categories = categories
            .split(';')
            .filter(|name| !name.is_empty())
            .map(DataCategory::from_name)
            .collect();

        rate_limits.push(RateLimit {
            categories,
            retry_after,
        });
    }

    rate_limits
}

/// Receives a notification whenever a rate limit deadline changes or expires.
///
/// Use [`RateLimits::is_active_for_category`] from the callback to inspect the new state.
pub trait RateLimitObserver: Send + Sync {
    /// Invoked after one or more deadlines were extended, and again once they expired.
    fn on_rate_limit_changed(&self, rate_limits: &RateLimits);
}

/// Rate limit deadlines per data category.
///
/// Deadlines are absolute timestamps in milliseconds, taken from the injected [`DateProvider`].
/// Each category is stored in its own atomic, so updates of unrelated categories never contend.
/// A deadline is only ever extended, never shortened.
///
/// While observers are registered, a background thread notifies them when the earliest pending
/// deadline passes. The thread exits as soon as no deadline is pending.
pub struct RateLimits {
    inner: Arc<Inner>,
}

struct Inner {
    date_provider: Arc<dyn DateProvider>,
    deadlines: [AtomicI64; SLOT_COUNT],
    observers: Mutex<Vec<Arc<dyn RateLimitObserver>>>,
    expiry: Mutex<ExpiryState>,
    wakeup: Condvar,
}

#[derive(Debug, Default)]
struct ExpiryState {
    /// The deadline the timer waits for.
    next: Option<i64>,
    /// A timer thread is alive.
    running: bool,
}

impl RateLimits {
    /// Creates an empty rate limit table.
    pub fn new(date_provider: Arc<dyn DateProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                date_provider,
                deadlines: std::array::from_fn(|_| AtomicI64::new(0)),
                observers: Mutex::new(Vec::new()),
                expiry: Mutex::new(ExpiryState::default()),
                wakeup: Condvar::new(),
            }),
        }
    }

    fn slot(category: DataCategory) -> Option<usize> {
        match category {
            DataCategory::All => Some(ALL_SLOT),
            other => other.index(),
        }
    }

    /// Returns `true` if the given category is currently rate limited.
    ///
    /// A limit on [`DataCategory::All`] applies to every category. Beyond that,
    /// [`DataCategory::Unknown`] is never limited.
    pub fn is_active_for_category(&self, category: DataCategory) -> bool {
        let now = self.inner.date_provider.now_millis();
        let deadlines = &self.inner.deadlines;

        if now < deadlines[ALL_SLOT].load(Ordering::Acquire) {
            return true;
        }

        match Self::slot(category) {
            Some(slot) => now < deadlines[slot].load(Ordering::Acquire),
            None => false,
        }
    }

    /// Returns `true` if any category is currently rate limited.
    pub fn is_any_rate_limit_active(&self) -> bool {
        let now = self.inner.date_provider.now_millis();
        self.inner.next_deadline_after(now).is_some()
    }

    /// Returns the deadline of the given category, if one was ever set.
    pub fn deadline(&self, category: DataCategory) -> Option<DateTime<Utc>> {
        let millis = self.inner.deadlines[Self::slot(category)?].load(Ordering::Acquire);
        if millis == 0 {
            return None;
        }
        millis_to_date_time(millis)
    }

    /// Updates the deadlines from the headers of a response.
    ///
    /// - A present `X-Sentry-Rate-Limits` header takes precedence. Listed categories receive the
    ///   entry's deadline, unknown categories are skipped, and an empty category list limits all
    ///   categories.
    /// - Without that header, HTTP 429 limits all categories for the duration of `Retry-After`,
    ///   which defaults to 60 seconds.
    /// - On HTTP 429 with both headers and a valid `Retry-After`, the `Retry-After` deadline also
    ///   applies to every concrete category not listed in the rate limits header.
    pub fn update_retry_after_limits(
        &self,
        rate_limits_header: Option<&str>,
        retry_after_header: Option<&str>,
        status_code: u16,
    ) {
        let now = self.inner.date_provider.now_millis();
        let deadline_after = |retry_after: RetryAfter| {
            now.saturating_add(duration_to_millis(retry_after.delay()))
        };

        let mut changed = false;

        if let Some(header) = rate_limits_header {
            let mut listed = [false; SLOT_COUNT];

            for rate_limit in parse_rate_limits(header) {
                let deadline = deadline_after(rate_limit.retry_after);

                if rate_limit.categories.is_empty() {
                    listed[ALL_SLOT] = true;
                    changed |= self.apply_if_longer(ALL_SLOT, deadline);
                    continue;
                }

                for category in rate_limit.categories {
                    let Some(slot) = Self::slot(category) else {
                        beacon_log::debug!("skipping rate limit for unknown category");
                        continue;
                    };

                    listed[slot] = true;
                    changed |= self.apply_if_longer(slot, deadline);
                }
            }

            let blanket = retry_after_header.and_then(|s| s.trim().parse::<RetryAfter>().ok());
            if let Some(retry_after) = blanket.filter(|_| status_code == 429) {
                let deadline = deadline_after(retry_after);
                for category in DataCategory::REPORTABLE {
                    let Some(slot) = category.index() else {
                        continue;
                    };
                    if !listed[slot] {
                        changed |= self.apply_if_longer(slot, deadline);
                    }
                }
            }
        } else if status_code == 429 {
            let retry_after = RetryAfter::parse_or_default(retry_after_header);
            changed |= self.apply_if_longer(ALL_SLOT, deadline_after(retry_after));
        }

        if changed {
            beacon_log::debug!(status_code, "rate limits updated");
            self.inner.notify_observers();
            self.schedule_expiry();
        }
    }

    /// Extends the deadline of a slot. Returns `true` if the deadline changed.
    fn apply_if_longer(&self, slot: usize, deadline: i64) -> bool {
        self.inner.deadlines[slot].fetch_max(deadline, Ordering::AcqRel) < deadline
    }

    /// Points the expiry timer at the earliest pending deadline, starting it if needed.
    fn schedule_expiry(&self) {
        if self.inner.observers.lock().is_empty() {
            return;
        }

        let now = self.inner.date_provider.now_millis();
        let mut state = self.inner.expiry.lock();
        state.next = self.inner.next_deadline_after(now);

        if state.next.is_none() || state.running {
            self.inner.wakeup.notify_one();
            return;
        }

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name("beacon-rate-limits".to_owned())
            .spawn(move || inner.run_expiry());

        match spawned {
            Ok(_) => state.running = true,
            Err(error) => beacon_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to start rate limit expiry timer"
            ),
        }
    }

    /// Registers an observer that is notified on every change.
    pub fn add_observer(&self, observer: Arc<dyn RateLimitObserver>) {
        self.inner.observers.lock().push(observer);
        self.schedule_expiry();
    }

    /// Removes an observer previously registered with [`add_observer`](Self::add_observer).
    pub fn remove_observer(&self, observer: &Arc<dyn RateLimitObserver>) {
        self.inner
            .observers
            .lock()
            .retain(|other| !Arc::ptr_eq(other, observer));
    }

    /// Removes all registered observers and cancels the pending expiry notification.
    pub fn clear_observers(&self) {
        self.inner.observers.lock().clear();

        let mut state = self.inner.expiry.lock();
        state.next = None;
        self.inner.wakeup.notify_one();
    }
}

impl Inner {
    /// Returns the earliest deadline that is still in the future.
    fn next_deadline_after(&self, now: i64) -> Option<i64> {
        self.deadlines
            .iter()
            .map(|deadline| deadline.load(Ordering::Acquire))
            .filter(|&deadline| now < deadline)
            .min()
    }

    fn notify_observers(self: &Arc<Self>) {
        let observers = self.observers.lock().clone();
        if observers.is_empty() {
            return;
        }

        let rate_limits = RateLimits {
            inner: self.clone(),
        };
        for observer in observers {
            observer.on_rate_limit_changed(&rate_limits);
        }
    }

    /// Body of the expiry timer thread.
    ///
    /// Sleeps until the scheduled deadline has passed on the injected clock, notifies observers,
    /// then moves on to the next pending deadline.
    fn run_expiry(self: Arc<Self>) {
        let mut state = self.expiry.lock();

        loop {
            let Some(deadline) = state.next else {
                state.running = false;
                return;
            };

            let now = self.date_provider.now_millis();
            if now < deadline {
                let remaining = Duration::from_millis((deadline - now) as u64);
                self.wakeup.wait_for(&mut state, remaining);
                continue;
            }

            state.next = self.next_deadline_after(now);
            beacon_log::debug!("rate limit expired");
            MutexGuard::unlocked(&mut state, || self.notify_observers());
        }
    }
}

impl fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = self.inner.date_provider.now_millis();
        let active = DataCategory::REPORTABLE
            .into_iter()
            .chain(Some(DataCategory::All))
            .filter_map(|category| {
                let deadline = self.inner.deadlines[Self::slot(category)?].load(Ordering::Relaxed);
                (now < deadline).then(|| (category, Duration::from_millis((deadline - now) as u64)))
            });

        f.debug_map().entries(active).finish()
    }
}
