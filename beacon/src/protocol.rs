//! Payload types that the client turns into envelope items.
//!
//! These are deliberately small. They carry the fields the pipeline needs for routing and
//! accounting plus free-form `tags`, `extra` and `attributes` maps for everything else.

use std::collections::BTreeMap;
use std::fmt;

use beacon_base_schema::EventId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Severity of an event.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Diagnostic information.
    Debug,
    /// Informational messages.
    Info,
    /// Conditions that may need attention.
    Warning,
    /// Errors. This is the default.
    #[default]
    Error,
    /// Crashes and other unrecoverable errors.
    Fatal,
}

/// Identifier of a trace, serialized as 32 hex characters.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct TraceId(Uuid);

impl TraceId {
    /// Creates a random trace id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_simple())
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({self})")
    }
}

impl Serialize for TraceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TraceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string = <std::borrow::Cow<'_, str>>::deserialize(deserializer)?;
        string
            .parse()
            .map(TraceId)
            .map_err(serde::de::Error::custom)
    }
}

/// Identifier of a span, serialized as 16 hex characters.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct SpanId(u64);

impl SpanId {
    /// Creates a random span id.
    pub fn new() -> Self {
        Self(rand::random())
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({self})")
    }
}

impl Serialize for SpanId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpanId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let string = <std::borrow::Cow<'_, str>>::deserialize(deserializer)?;
        u64::from_str_radix(&string, 16)
            .map(SpanId)
            .map_err(serde::de::Error::custom)
    }
}

/// An error or message event.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Event {
    /// Unique identifier of this event.
    pub event_id: EventId,
    /// Time at which the event was captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Severity of the event.
    #[serde(default)]
    pub level: Level,
    /// A human readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Name of the logger that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    /// The environment, filled in from the configuration when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// The release, filled in from the configuration when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    /// Indexed key-value pairs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Arbitrary additional data.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl Event {
    /// Creates an event with a message.
    pub fn message(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

/// A unit of work within a [`Transaction`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Span {
    /// Identifier of this span.
    pub span_id: SpanId,
    /// Identifier of the enclosing span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<SpanId>,
    /// The trace this span belongs to.
    pub trace_id: TraceId,
    /// Short operation name, such as `db.query`.
    pub op: String,
    /// Longer description of the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Start time of the span.
    pub start_timestamp: DateTime<Utc>,
    /// End time of the span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A traced operation together with its child spans.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Transaction {
    /// Unique identifier of this transaction.
    pub event_id: EventId,
    /// Name of the transaction, such as a route.
    pub transaction: String,
    /// Identifier of the root span.
    pub span_id: SpanId,
    /// The trace this transaction belongs to.
    pub trace_id: TraceId,
    /// Operation of the root span.
    pub op: String,
    /// Start time of the transaction.
    pub start_timestamp: DateTime<Utc>,
    /// End time of the transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// An explicit sampling decision. Overrides the configured traces sample rate.
    #[serde(skip)]
    pub sampled: Option<bool>,
    /// The environment, filled in from the configuration when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// The release, filled in from the configuration when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    /// Finished child spans.
    #[serde(default)]
    pub spans: Vec<Span>,
}

impl Transaction {
    /// Starts a new transaction in a new trace.
    pub fn new(name: impl Into<String>, op: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new(),
            transaction: name.into(),
            span_id: SpanId::new(),
            trace_id: TraceId::new(),
            op: op.into(),
            start_timestamp: Utc::now(),
            timestamp: None,
            sampled: None,
            environment: None,
            release: None,
            spans: Vec::new(),
        }
    }

    /// Starts a child span of the root span.
    ///
    /// The span is not part of the transaction until it is passed to
    /// [`finish_span`](Self::finish_span).
    pub fn start_child(&self, op: impl Into<String>, description: Option<String>) -> Span {
        Span {
            span_id: SpanId::new(),
            parent_span_id: Some(self.span_id),
            trace_id: self.trace_id,
            op: op.into(),
            description,
            start_timestamp: Utc::now(),
            timestamp: None,
        }
    }

    /// Ends a child span and adds it to the transaction.
    pub fn finish_span(&mut self, mut span: Span) {
        span.timestamp.get_or_insert_with(Utc::now);
        self.spans.push(span);
    }

    /// Sets the end time of the transaction, unless it was set before.
    pub fn finish(&mut self) {
        self.timestamp.get_or_insert_with(Utc::now);
    }
}

/// Status of a cron monitor check-in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInStatus {
    /// The job finished without issues.
    Ok,
    /// The job failed.
    Error,
    /// The job started and has not finished yet.
    InProgress,
}

fn uuid_simple<S>(uuid: &Uuid, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    uuid.as_simple().serialize(serializer)
}

/// A check-in of a scheduled job.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct CheckIn {
    /// Unique identifier of this check-in.
    #[serde(serialize_with = "uuid_simple")]
    pub check_in_id: Uuid,
    /// Identifier of the monitor for this check-in.
    pub monitor_slug: String,
    /// Status of this check-in.
    pub status: CheckInStatus,
    /// The environment to associate the check-in with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Duration of the job in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl CheckIn {
    /// Creates a check-in for the given monitor.
    pub fn new(monitor_slug: impl Into<String>, status: CheckInStatus) -> Self {
        Self {
            check_in_id: Uuid::new_v4(),
            monitor_slug: monitor_slug.into(),
            status,
            environment: None,
            duration: None,
        }
    }
}

/// How a replay segment was recorded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayType {
    /// Continuously recorded for the whole session.
    #[default]
    Session,
    /// Recorded into a ring buffer and flushed when an error occurred.
    Buffer,
}

/// One segment of a session replay.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Replay {
    /// Identifier of the replay. All segments of a replay share it.
    pub replay_id: EventId,
    /// Position of this segment within the replay.
    pub segment_id: u32,
    /// How the segment was recorded.
    pub replay_type: ReplayType,
    /// Time at which the segment ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// The encoded recording. Sent as a separate item.
    #[serde(skip)]
    pub recording: Bytes,
}

/// Severity of a log record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very fine grained diagnostics.
    Trace,
    /// Diagnostics.
    Debug,
    /// Informational messages.
    #[default]
    Info,
    /// Conditions that may need attention.
    Warn,
    /// Errors.
    Error,
    /// Unrecoverable errors.
    Fatal,
}

/// A structured log record.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Log {
    /// Time at which the record was emitted.
    pub timestamp: DateTime<Utc>,
    /// Severity of the record.
    pub level: LogLevel,
    /// The formatted message.
    pub body: String,
    /// The trace that was active when the record was emitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Structured attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl Log {
    /// Creates a log record timestamped now.
    pub fn new(level: LogLevel, body: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            body: body.into(),
            trace_id: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// Kind of a [`TraceMetric`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// A value that is summed up.
    Counter,
    /// A value that replaces the previous one.
    Gauge,
    /// A value that is aggregated into a distribution.
    Distribution,
}

/// A metric sample associated with a trace.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct TraceMetric {
    /// Time at which the value was recorded.
    pub timestamp: DateTime<Utc>,
    /// Name of the metric.
    pub name: String,
    /// Kind of the metric.
    #[serde(rename = "type")]
    pub ty: MetricType,
    /// The recorded value.
    pub value: f64,
    /// Unit of the value, such as `millisecond`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// The trace that was active when the value was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Structured attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

/// State of a release health session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The session is running.
    #[default]
    Ok,
    /// The session ended normally.
    Exited,
    /// The session ended with a crash.
    Crashed,
    /// The session ended unexpectedly, without a crash.
    Abnormal,
}

/// Release and environment of a session.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct SessionAttributes {
    /// The release the session belongs to.
    pub release: String,
    /// The environment the session belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// An update of a release health session.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SessionUpdate {
    /// Identifier of the session.
    #[serde(rename = "sid")]
    pub session_id: Uuid,
    /// Identifier of the user or device.
    #[serde(rename = "did", default, skip_serializing_if = "Option::is_none")]
    pub distinct_id: Option<String>,
    /// `true` for the first update of a session.
    #[serde(default)]
    pub init: bool,
    /// Start time of the session.
    pub started: DateTime<Utc>,
    /// Time of this update.
    pub timestamp: DateTime<Utc>,
    /// Current state of the session.
    pub status: SessionStatus,
    /// Number of errors in the session so far.
    #[serde(default)]
    pub errors: u64,
    /// Release and environment.
    pub attrs: SessionAttributes,
}

/// Wire format of batched log and metric items.
#[derive(Debug, Serialize)]
pub(crate) struct ItemContainer<'a, T> {
    pub items: &'a [T],
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_event_json() {
        let mut event = Event::message(Level::Warning, "disk almost full");
        event.event_id = "52df9022835246eeb317dbd739ccd059".parse().unwrap();
        event.tags.insert("volume".to_owned(), "/data".to_owned());

        insta::assert_json_snapshot!(event, @r###"
        {
          "event_id": "52df9022835246eeb317dbd739ccd059",
          "level": "warning",
          "message": "disk almost full",
          "tags": {
            "volume": "/data"
          }
        }
        "###);
    }

    #[test]
    fn test_span_id_roundtrip() {
        let span_id = SpanId(0xdead_beef);
        let json = serde_json::to_string(&span_id).unwrap();
        assert_eq!(json, r#""00000000deadbeef""#);
        assert_eq!(serde_json::from_str::<SpanId>(&json).unwrap(), span_id);
    }

    #[test]
    fn test_transaction_spans() {
        let mut transaction = Transaction::new("/users", "http.server");
        let span = transaction.start_child("db.query", Some("select users".to_owned()));
        transaction.finish_span(span);
        transaction.finish();

        assert_eq!(transaction.spans.len(), 1);
        assert_eq!(transaction.spans[0].parent_span_id, Some(transaction.span_id));
        assert_eq!(transaction.spans[0].trace_id, transaction.trace_id);
        assert!(transaction.timestamp.is_some());

        let json = serde_json::to_value(&transaction).unwrap();
        assert!(json.get("sampled").is_none());
    }

    #[test]
    fn test_check_in_json() {
        let check_in = CheckIn {
            check_in_id: "a460c25ff2554577b920fcfacae4e5eb".parse().unwrap(),
            monitor_slug: "nightly-backup".to_owned(),
            status: CheckInStatus::InProgress,
            environment: None,
            duration: Some(2.5),
        };

        insta::assert_json_snapshot!(check_in, @r###"
        {
          "check_in_id": "a460c25ff2554577b920fcfacae4e5eb",
          "monitor_slug": "nightly-backup",
          "status": "in_progress",
          "duration": 2.5
        }
        "###);
    }

    #[test]
    fn test_session_json() {
        let started = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let session = SessionUpdate {
            session_id: "8333339f5675426d8e7ebd8f88db14b6".parse().unwrap(),
            distinct_id: None,
            init: true,
            started,
            timestamp: started,
            status: SessionStatus::Ok,
            errors: 0,
            attrs: SessionAttributes {
                release: "app@1.0.0".to_owned(),
                environment: Some("production".to_owned()),
            },
        };

        insta::assert_json_snapshot!(session, @r###"
        {
          "sid": "8333339f-5675-426d-8e7e-bd8f88db14b6",
          "init": true,
          "started": "2024-01-01T00:00:00Z",
          "timestamp": "2024-01-01T00:00:00Z",
          "status": "ok",
          "errors": 0,
          "attrs": {
            "release": "app@1.0.0",
            "environment": "production"
          }
        }
        "###);
    }
}
