use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The reason why telemetry was dropped on the client.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Dropped by a sampling decision.
    SampleRate,
    /// Dropped by a `before_send` hook.
    BeforeSend,
    /// Dropped by an event processor.
    EventProcessor,
    /// Delivery failed and will not be retried.
    NetworkError,
    /// Evicted from a full durability cache.
    CacheOverflow,
    /// Dropped because the server rate limited the category.
    #[serde(rename = "ratelimit_backoff")]
    RateLimitBackoff,
    /// Rejected by a full send queue.
    QueueOverflow,
}

impl DiscardReason {
    /// All discard reasons in the order of their [`index`](Self::index).
    pub const ALL: [DiscardReason; 7] = [
        Self::SampleRate,
        Self::BeforeSend,
        Self::EventProcessor,
        Self::NetworkError,
        Self::CacheOverflow,
        Self::RateLimitBackoff,
        Self::QueueOverflow,
    ];

    /// Returns the canonical name of this reason.
    pub fn name(self) -> &'static str {
        match self {
            Self::SampleRate => "sample_rate",
            Self::BeforeSend => "before_send",
            Self::EventProcessor => "event_processor",
            Self::NetworkError => "network_error",
            Self::CacheOverflow => "cache_overflow",
            Self::RateLimitBackoff => "ratelimit_backoff",
            Self::QueueOverflow => "queue_overflow",
        }
    }

    /// Returns the dense index of this reason within [`ALL`](Self::ALL).
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown [`DiscardReason`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown discard reason: {0}")]
pub struct ParseDiscardReasonError(String);

impl FromStr for DiscardReason {
    type Err = ParseDiscardReasonError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.name() == string)
            .ok_or_else(|| ParseDiscardReasonError(string.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexes_match_order() {
        for (index, reason) in DiscardReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), index);
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "ratelimit_backoff".parse::<DiscardReason>(),
            Ok(DiscardReason::RateLimitBackoff)
        );
        assert!("rate_limit_backoff".parse::<DiscardReason>().is_err());
    }

    #[test]
    fn test_serde_names_match_display() {
        for reason in DiscardReason::ALL {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{reason}\""));
        }
    }
}
