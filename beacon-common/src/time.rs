//! Utilities to deal with date-time types and the clock used by the pipeline.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Source of the current wall-clock time.
///
/// Rate limit deadlines and `sent_at` headers are computed from a [`DateProvider`] rather than
/// reading the system clock directly, so that tests can control the passage of time.
pub trait DateProvider: fmt::Debug + Send + Sync {
    /// Returns the current date and time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time as milliseconds since the UNIX epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// A [`DateProvider`] backed by the system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDateProvider;

impl DateProvider for SystemDateProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Converts milliseconds since the UNIX epoch into a `DateTime`.
///
/// Returns `None` if the value is out of the representable range.
pub fn millis_to_date_time(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Converts a duration into whole milliseconds, saturating at `i64::MAX`.
pub fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(any(test, feature = "test"))]
pub use self::test_provider::TestDateProvider;

#[cfg(any(test, feature = "test"))]
mod test_provider {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use chrono::{DateTime, Utc};

    use super::{DateProvider, duration_to_millis, millis_to_date_time};

    /// A manually driven clock for tests.
    #[derive(Debug)]
    pub struct TestDateProvider {
        millis: AtomicI64,
    }

    impl TestDateProvider {
        /// Creates a clock that starts at the given time.
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                millis: AtomicI64::new(start.timestamp_millis()),
            }
        }

        /// Creates a clock starting at the given number of milliseconds since the epoch.
        pub fn from_millis(millis: i64) -> Self {
            Self {
                millis: AtomicI64::new(millis),
            }
        }

        /// Moves the clock forward.
        pub fn advance(&self, duration: Duration) {
            self.millis
                .fetch_add(duration_to_millis(duration), Ordering::SeqCst);
        }

        /// Sets the clock to an absolute time.
        pub fn set(&self, now: DateTime<Utc>) {
            self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
        }
    }

    impl Default for TestDateProvider {
        fn default() -> Self {
            Self::from_millis(1_700_000_000_000)
        }
    }

    impl DateProvider for TestDateProvider {
        fn now(&self) -> DateTime<Utc> {
            millis_to_date_time(self.now_millis()).unwrap_or_default()
        }

        fn now_millis(&self) -> i64 {
            self.millis.load(Ordering::SeqCst)
        }
    }
}
