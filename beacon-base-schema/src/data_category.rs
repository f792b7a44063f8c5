//! Defines the [`DataCategory`] type that classifies telemetry handled by the pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Classifies a unit of telemetry for rate limiting and loss accounting.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(i8)]
pub enum DataCategory {
    /// Error events.
    Error = 0,
    /// Transaction events.
    Transaction = 1,
    /// Spans, including the spans contained in a transaction.
    Span = 2,
    /// Session updates.
    Session = 3,
    /// An attachment.
    Attachment = 4,
    /// User feedback.
    UserReport = 5,
    /// Profiles and profile chunks.
    Profile = 6,
    /// Monitor check-ins.
    Monitor = 7,
    /// Metric buckets.
    MetricBucket = 8,
    /// Session replays.
    Replay = 9,
    /// Trace metrics.
    TraceMetric = 10,
    /// Log entries.
    #[serde(rename = "log_item")]
    Log = 11,
    /// Applies to all categories.
    ///
    /// Only used for rate limits that were sent without a category list. Never reported.
    #[serde(rename = "__all__")]
    All = -2,
    /// Any other data category not known by this version of the pipeline.
    #[serde(other)]
    Unknown = -1,
}

impl DataCategory {
    /// All categories that can be rate limited individually and counted in client reports.
    pub const REPORTABLE: [DataCategory; 12] = [
        Self::Error,
        Self::Transaction,
        Self::Span,
        Self::Session,
        Self::Attachment,
        Self::UserReport,
        Self::Profile,
        Self::Monitor,
        Self::MetricBucket,
        Self::Replay,
        Self::TraceMetric,
        Self::Log,
    ];

    /// Returns the data category corresponding to the given name.
    ///
    /// Names are matched case-insensitively, so that both the canonical `metric_bucket` and
    /// spellings like `MetricBucket` are understood.
    pub fn from_name(string: &str) -> Self {
        match string.to_ascii_lowercase().as_str() {
            "error" => Self::Error,
            "transaction" => Self::Transaction,
            "span" => Self::Span,
            "session" => Self::Session,
            "attachment" => Self::Attachment,
            "user_report" | "userreport" | "feedback" => Self::UserReport,
            "profile" | "profile_chunk" => Self::Profile,
            "monitor" => Self::Monitor,
            "metric_bucket" | "metricbucket" => Self::MetricBucket,
            "replay" => Self::Replay,
            "trace_metric" | "tracemetric" => Self::TraceMetric,
            "log_item" | "logitem" | "log" => Self::Log,
            _ => Self::Unknown,
        }
    }

    /// Returns the canonical name of this data category.
    pub fn name(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Transaction => "transaction",
            Self::Span => "span",
            Self::Session => "session",
            Self::Attachment => "attachment",
            Self::UserReport => "user_report",
            Self::Profile => "profile",
            Self::Monitor => "monitor",
            Self::MetricBucket => "metric_bucket",
            Self::Replay => "replay",
            Self::TraceMetric => "trace_metric",
            Self::Log => "log_item",
            Self::All => "__all__",
            Self::Unknown => "unknown",
        }
    }

    /// Returns the dense index of this category within [`REPORTABLE`](Self::REPORTABLE).
    ///
    /// Returns `None` for [`All`](Self::All) and [`Unknown`](Self::Unknown).
    pub fn index(self) -> Option<usize> {
        usize::try_from(self as i8).ok()
    }

    /// Returns `true` if this category is a concrete, reportable category.
    pub fn is_reportable(self) -> bool {
        self.index().is_some()
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for DataCategory {
    type Err = ();

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(string))
    }
}
