use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use beacon_base_schema::DataCategory;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::{SmallVec, smallvec};

use crate::envelope::EnvelopeError;

/// Content type of JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Quantities per data category of a single item.
pub type ItemQuantities = SmallVec<[(DataCategory, usize); 2]>;

/// A single typed payload within an [`Envelope`](crate::envelope::Envelope).
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub(super) headers: ItemHeaders,
    pub(super) payload: Bytes,
}

impl Item {
    /// Creates a new item with the given type and an empty payload.
    pub fn new(ty: ItemType) -> Self {
        Self {
            headers: ItemHeaders {
                ty,
                length: Some(0),
                content_type: None,
                filename: None,
                item_count: None,
                other: BTreeMap::new(),
            },
            payload: Bytes::new(),
        }
    }

    /// Creates a new item with a JSON serialized payload.
    pub fn from_json<T>(ty: ItemType, value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        let mut item = Self::new(ty);
        item.set_payload(CONTENT_TYPE_JSON, serde_json::to_vec(value)?);
        Ok(item)
    }

    /// Returns the `ItemType` of this item.
    pub fn ty(&self) -> &ItemType {
        &self.headers.ty
    }

    /// Returns the length of this item's payload.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns `true` if this item's payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns the content type of this item's payload.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.content_type.as_deref()
    }

    /// Returns the payload of this item.
    ///
    /// Cloning the payload is cheap.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    /// Sets the payload and content-type of this envelope item.
    pub fn set_payload<B>(&mut self, content_type: &str, payload: B)
    where
        B: Into<Bytes>,
    {
        let payload = payload.into();
        self.headers.length = u32::try_from(payload.len()).ok();
        self.headers.content_type = Some(content_type.to_owned());
        self.payload = payload;
    }

    /// Returns the file name of this item, if it is an attachment.
    pub fn filename(&self) -> Option<&str> {
        self.headers.filename.as_deref()
    }

    /// Returns the number of entries in a container item, such as a batch of logs.
    pub fn item_count(&self) -> Option<u32> {
        self.headers.item_count
    }

    /// Sets the number of entries in a container item.
    pub fn set_item_count(&mut self, item_count: u32) {
        self.headers.item_count = Some(item_count);
    }

    /// Returns the quantities this item contributes per data category.
    ///
    /// A transaction additionally counts every span in its payload. Container items count the
    /// entries declared in their `item_count` header. Client reports and unknown items are not
    /// counted.
    pub fn quantities(&self) -> ItemQuantities {
        match self.ty() {
            ItemType::Event => smallvec![(DataCategory::Error, 1)],
            ItemType::Transaction => {
                let mut quantities: ItemQuantities = smallvec![(DataCategory::Transaction, 1)];
                let spans = self.span_count();
                if spans > 0 {
                    quantities.push((DataCategory::Span, spans));
                }
                quantities
            }
            ItemType::Span => smallvec![(DataCategory::Span, 1)],
            ItemType::Session | ItemType::Sessions => smallvec![(DataCategory::Session, 1)],
            ItemType::Attachment => smallvec![(DataCategory::Attachment, 1)],
            ItemType::UserReport | ItemType::Feedback => {
                smallvec![(DataCategory::UserReport, 1)]
            }
            ItemType::Profile | ItemType::ProfileChunk => smallvec![(DataCategory::Profile, 1)],
            ItemType::CheckIn => smallvec![(DataCategory::Monitor, 1)],
            ItemType::Statsd | ItemType::MetricBuckets => {
                smallvec![(DataCategory::MetricBucket, 1)]
            }
            ItemType::ReplayEvent | ItemType::ReplayRecording | ItemType::ReplayVideo => {
                smallvec![(DataCategory::Replay, 1)]
            }
            ItemType::TraceMetric => smallvec![(DataCategory::TraceMetric, self.container_count())],
            ItemType::Log => smallvec![(DataCategory::Log, self.container_count())],
            ItemType::ClientReport | ItemType::Unknown(_) => smallvec![],
        }
    }

    fn container_count(&self) -> usize {
        self.item_count().map_or(1, |count| count as usize)
    }

    /// Counts the entries of the `spans` array in a transaction payload.
    fn span_count(&self) -> usize {
        #[derive(Deserialize)]
        struct TransactionSpans {
            #[serde(default)]
            spans: Vec<serde::de::IgnoredAny>,
        }

        serde_json::from_slice::<TransactionSpans>(&self.payload)
            .map(|transaction| transaction.spans.len())
            .unwrap_or(0)
    }

    /// Parses an [`Item`] from raw bytes.
    ///
    /// Returns the item and the number of bytes consumed, including the trailing newline.
    pub fn parse(bytes: Bytes) -> Result<(Item, usize), EnvelopeError> {
        let slice = bytes.as_ref();
        let mut stream = serde_json::Deserializer::from_slice(slice).into_iter();

        let headers: ItemHeaders = match stream.next() {
            None => return Err(EnvelopeError::UnexpectedEof),
            Some(Err(error)) => return Err(EnvelopeError::InvalidItemHeader(error)),
            Some(Ok(headers)) => headers,
        };

        let headers_end = stream.byte_offset();
        super::require_termination(slice, headers_end)?;

        // The last header does not require a trailing newline.
        let payload_start = std::cmp::min(headers_end + 1, bytes.len());
        let payload_end = match headers.length {
            Some(len) => {
                let payload_end = payload_start + len as usize;
                if bytes.len() < payload_end {
                    return Err(EnvelopeError::UnexpectedEof);
                }

                super::require_termination(slice, payload_end)?;
                payload_end
            }
            None => match bytes[payload_start..].iter().position(|b| *b == b'\n') {
                Some(relative_end) => payload_start + relative_end,
                None => bytes.len(),
            },
        };

        let payload = bytes.slice(payload_start..payload_end);
        let item = Item { headers, payload };

        Ok((item, payload_end + 1))
    }
}

/// The type of an envelope item.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ItemType {
    /// Error event payload encoded in JSON.
    Event,
    /// Transaction event payload encoded in JSON, including its spans.
    Transaction,
    /// A standalone span.
    Span,
    /// A single session update.
    Session,
    /// Aggregated session counts.
    Sessions,
    /// Raw payload of an arbitrary attachment.
    Attachment,
    /// User feedback in the legacy format.
    UserReport,
    /// User feedback sent as an event.
    Feedback,
    /// A profile encoded as JSON.
    Profile,
    /// A chunk of a continuous profiling session.
    ProfileChunk,
    /// Monitor check-in encoded as JSON.
    CheckIn,
    /// Metrics in statsd text encoding.
    Statsd,
    /// Buckets of preaggregated metrics encoded as JSON.
    MetricBuckets,
    /// Replay metadata.
    ReplayEvent,
    /// Replay recording data.
    ReplayRecording,
    /// Replay video data.
    ReplayVideo,
    /// Internal report of discarded data.
    ClientReport,
    /// A batch of log entries.
    Log,
    /// A batch of trace metrics.
    TraceMetric,
    /// An item type that is not known by this version of the pipeline.
    Unknown(String),
    // Keep `Unknown` last in the list. Add new items above `Unknown`.
}

impl ItemType {
    /// Returns the variant name of the item type.
    ///
    /// Unlike [`Self::as_str`] this returns an unknown value as `unknown`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Transaction => "transaction",
            Self::Span => "span",
            Self::Session => "session",
            Self::Sessions => "sessions",
            Self::Attachment => "attachment",
            Self::UserReport => "user_report",
            Self::Feedback => "feedback",
            Self::Profile => "profile",
            Self::ProfileChunk => "profile_chunk",
            Self::CheckIn => "check_in",
            Self::Statsd => "statsd",
            Self::MetricBuckets => "metric_buckets",
            Self::ReplayEvent => "replay_event",
            Self::ReplayRecording => "replay_recording",
            Self::ReplayVideo => "replay_video",
            Self::ClientReport => "client_report",
            Self::Log => "log",
            Self::TraceMetric => "trace_metric",
            Self::Unknown(_) => "unknown",
        }
    }

    /// Returns the item type as a string.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unknown(s) => s,
            _ => self.name(),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "event" => Self::Event,
            "transaction" => Self::Transaction,
            "span" => Self::Span,
            "session" => Self::Session,
            "sessions" => Self::Sessions,
            "attachment" => Self::Attachment,
            "user_report" => Self::UserReport,
            "feedback" => Self::Feedback,
            "profile" => Self::Profile,
            "profile_chunk" => Self::ProfileChunk,
            "check_in" => Self::CheckIn,
            "statsd" => Self::Statsd,
            "metric_buckets" => Self::MetricBuckets,
            "replay_event" => Self::ReplayEvent,
            "replay_recording" => Self::ReplayRecording,
            "replay_video" => Self::ReplayVideo,
            "client_report" => Self::ClientReport,
            "log" => Self::Log,
            "trace_metric" => Self::TraceMetric,
            other => Self::Unknown(other.to_owned()),
        })
    }
}

impl Serialize for ItemType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ItemType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = Cow::<'_, str>::deserialize(deserializer)?;
        Ok(match name.parse() {
            Ok(ty) => ty,
            Err(never) => match never {},
        })
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ItemHeaders {
    /// The type of the item.
    #[serde(rename = "type")]
    ty: ItemType,

    /// Content length of the item.
    ///
    /// Can be omitted if the item does not contain new lines. In this case, the item payload is
    /// parsed until the first newline is encountered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    length: Option<u32>,

    /// Content type of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,

    /// If this is an attachment item, this may contain the original file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,

    /// Number of entries in a container item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    item_count: Option<u32>,

    /// Other attributes for forward compatibility.
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantities(item: &Item) -> Vec<(DataCategory, usize)> {
        item.quantities().into_iter().collect()
    }

    #[test]
    fn test_item_type_names() {
        let ty: ItemType = "profile_chunk".parse().unwrap();
        assert_eq!(ty, ItemType::ProfileChunk);
        assert_eq!(ty.to_string(), "profile_chunk");

        let unknown: ItemType = "hologram".parse().unwrap();
        assert_eq!(unknown, ItemType::Unknown("hologram".to_owned()));
        assert_eq!(unknown.name(), "unknown");
        assert_eq!(unknown.as_str(), "hologram");
    }

    #[test]
    fn test_transaction_counts_spans() {
        let payload = serde_json::json!({
            "type": "transaction",
            "spans": [{"op": "a"}, {"op": "b"}, {"op": "c"}, {"op": "d"}],
        });
        let item = Item::from_json(ItemType::Transaction, &payload).unwrap();

        assert_eq!(
            quantities(&item),
            vec![(DataCategory::Transaction, 1), (DataCategory::Span, 4)]
        );
    }

    #[test]
    fn test_transaction_without_spans() {
        let mut item = Item::new(ItemType::Transaction);
        item.set_payload(CONTENT_TYPE_JSON, "not json");
        assert_eq!(quantities(&item), vec![(DataCategory::Transaction, 1)]);
    }

    #[test]
    fn test_container_items_use_item_count() {
        let mut logs = Item::new(ItemType::Log);
        assert_eq!(quantities(&logs), vec![(DataCategory::Log, 1)]);

        logs.set_item_count(5);
        assert_eq!(quantities(&logs), vec![(DataCategory::Log, 5)]);

        let mut metrics = Item::new(ItemType::TraceMetric);
        metrics.set_item_count(3);
        assert_eq!(quantities(&metrics), vec![(DataCategory::TraceMetric, 3)]);
    }

    #[test]
    fn test_uncounted_items() {
        assert!(Item::new(ItemType::ClientReport).quantities().is_empty());
        assert!(
            Item::new(ItemType::Unknown("hologram".to_owned()))
                .quantities()
                .is_empty()
        );
    }

    #[test]
    fn test_parse_item_without_length() {
        let bytes = Bytes::from_static(b"{\"type\":\"attachment\"}\nhello\n");
        let (item, size) = Item::parse(bytes).unwrap();

        assert_eq!(item.ty(), &ItemType::Attachment);
        assert_eq!(item.payload(), Bytes::from_static(b"hello"));
        assert_eq!(size, 28);
    }

    #[test]
    fn test_parse_item_truncated() {
        let bytes = Bytes::from_static(b"{\"type\":\"attachment\",\"length\":10}\nhello");
        assert!(matches!(
            Item::parse(bytes),
            Err(EnvelopeError::UnexpectedEof)
        ));
    }
}
