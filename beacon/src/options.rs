use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use beacon_config::Config;
use beacon_transport::hint::Hint;

use crate::protocol::{Event, Log, Transaction};

/// Hook that can modify or drop an event before it is sent.
pub type BeforeSendEvent = Arc<dyn Fn(Event, &Hint) -> Option<Event> + Send + Sync>;

/// Hook that can modify or drop a transaction before it is sent.
pub type BeforeSendTransaction =
    Arc<dyn Fn(Transaction, &Hint) -> Option<Transaction> + Send + Sync>;

/// Hook that can modify or drop a log record before it is sent.
pub type BeforeSendLog = Arc<dyn Fn(Log) -> Option<Log> + Send + Sync>;

/// Enriches or drops captured events before sampling.
///
/// Processors run in the order they were registered. The first processor that returns `None`
/// drops the event, and later processors do not run.
pub trait EventProcessor: Send + Sync {
    /// Processes an error event.
    fn process_event(&self, event: Event, hint: &Hint) -> Option<Event>;

    /// Processes a transaction. Keeps the transaction unchanged by default.
    fn process_transaction(&self, transaction: Transaction, hint: &Hint) -> Option<Transaction> {
        let _ = hint;
        Some(transaction)
    }
}

/// Event level settings of a [`Client`](crate::Client).
///
/// Values are taken from the [`Config`], hooks are registered on the
/// [`ClientBuilder`](crate::ClientBuilder).
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub(crate) environment: Option<String>,
    pub(crate) release: Option<String>,
    pub(crate) sample_rate: f64,
    pub(crate) traces_sample_rate: Option<f64>,
    pub(crate) flush_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) before_send: Option<BeforeSendEvent>,
    pub(crate) before_send_transaction: Option<BeforeSendTransaction>,
    pub(crate) before_send_log: Option<BeforeSendLog>,
    pub(crate) event_processors: Vec<Arc<dyn EventProcessor>>,
}

impl ClientOptions {
    /// Reads the options from the configuration, without any hooks.
    pub fn from_config(config: &Config) -> Self {
        Self {
            environment: config.environment().map(str::to_owned),
            release: config.release().map(str::to_owned),
            sample_rate: config.sample_rate(),
            traces_sample_rate: config.traces_sample_rate(),
            flush_timeout: config.flush_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
            ..Self::default()
        }
    }

    /// Returns the environment attached to events.
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// Returns the release attached to events.
    pub fn release(&self) -> Option<&str> {
        self.release.as_deref()
    }

    /// Returns the sample rate for error events.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Returns the sample rate for transactions, if any.
    pub fn traces_sample_rate(&self) -> Option<f64> {
        self.traces_sample_rate
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("environment", &self.environment)
            .field("release", &self.release)
            .field("sample_rate", &self.sample_rate)
            .field("traces_sample_rate", &self.traces_sample_rate)
            .field("flush_timeout", &self.flush_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("before_send", &self.before_send.is_some())
            .field(
                "before_send_transaction",
                &self.before_send_transaction.is_some(),
            )
            .field("before_send_log", &self.before_send_log.is_some())
            .field("event_processors", &self.event_processors.len())
            .finish()
    }
}

/// Makes a random sampling decision. Rates of `1.0` and above always keep.
pub(crate) fn sample(rate: f64) -> bool {
    rate >= 1.0 || (rate > 0.0 && rand::random::<f64>() < rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_bounds() {
        assert!(sample(1.0));
        assert!(!sample(0.0));
        assert!(!sample(-1.0));
    }

    #[test]
    fn test_from_config() {
        let config = Config::from_json_value(serde_json::json!({
            "client": {
                "environment": "staging",
                "sample_rate": 0.5,
            },
        }))
        .unwrap();

        let options = ClientOptions::from_config(&config);
        insta::assert_debug_snapshot!(options, @r###"
        ClientOptions {
            environment: Some(
                "staging",
            ),
            release: None,
            sample_rate: 0.5,
            traces_sample_rate: None,
            flush_timeout: 15s,
            shutdown_timeout: 2s,
            before_send: false,
            before_send_transaction: false,
            before_send_log: false,
            event_processors: 0,
        }
        "###);
    }
}
