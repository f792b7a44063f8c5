//! Implementation of event envelopes.
//!
//! Envelopes are the unit of delivery. Each envelope has global headers and an ordered list of
//! typed items, such as an event payload, an attachment or a batch of logs. An envelope is created
//! by the client, owned by the connection until it is delivered, discarded or cached, and is
//! sent in a single HTTP request.
//!
//! The serialization format is newline delimited:
//!
//! ```plain
//! <json headers>\n
//! <item headers>\n
//! payload\n
//! ...
//! ```
//!
//! Headers must not contain line breaks. Payloads can be any binary encoding, which is enabled by
//! declaring an explicit length in the item headers. Example:
//!
//! ```plain
//! {"event_id":"9ec79c33ec9942ab8353589fcb2e04dc","sent_at":"2024-01-01T00:00:00Z"}
//! {"type":"event","length":41,"content_type":"application/json"}
//! {"message":"hello world","level":"error"}
//! ```

use std::collections::BTreeMap;
use std::io::{self, Write};

use beacon_base_schema::EventId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sentry_types::Dsn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

mod item;

pub use self::item::*;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("missing envelope header")]
    MissingHeader,
    #[error("missing newline after header or payload")]
    MissingNewline,
    #[error("invalid envelope header")]
    InvalidHeader(#[source] serde_json::Error),
    #[error("invalid item header")]
    InvalidItemHeader(#[source] serde_json::Error),
    #[error("failed to write header")]
    HeaderIoFailed(#[source] serde_json::Error),
    #[error("failed to write payload")]
    PayloadIoFailed(#[source] io::Error),
}

/// The items of an envelope.
pub type Items = SmallVec<[Item; 3]>;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct EnvelopeHeaders {
    /// Unique identifier of this envelope.
    ///
    /// Envelopes parsed without an identifier are assigned a new random one.
    #[serde(default)]
    event_id: EventId,

    /// The DSN this envelope is addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dsn: Option<Dsn>,

    /// Timestamp when the envelope was sent.
    ///
    /// Set right before every delivery attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sent_at: Option<DateTime<Utc>>,

    /// Other attributes for forward compatibility.
    #[serde(flatten)]
    other: BTreeMap<String, Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    headers: EnvelopeHeaders,
    items: Items,
}

impl Envelope {
    /// Creates an envelope without items.
    pub fn new(event_id: EventId) -> Box<Self> {
        Self::from_parts(
            EnvelopeHeaders {
                event_id,
                dsn: None,
                sent_at: None,
                other: BTreeMap::new(),
            },
            Items::new(),
        )
    }

    /// Creates an envelope from headers and items.
    pub fn from_parts(headers: EnvelopeHeaders, items: Items) -> Box<Self> {
        Box::new(Self { headers, items })
    }

    /// Parses an envelope from bytes.
    pub fn parse_bytes(bytes: Bytes) -> Result<Box<Self>, EnvelopeError> {
        let (headers, offset) = Self::parse_headers(&bytes)?;
        let items = Self::parse_items(&bytes, offset)?;

        Ok(Box::new(Envelope { headers, items }))
    }

    /// Returns the envelope headers.
    pub fn headers(&self) -> &EnvelopeHeaders {
        &self.headers
    }

    /// Returns the number of items in this envelope.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if this envelope does not contain any items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Unique identifier of this envelope.
    pub fn event_id(&self) -> EventId {
        self.headers.event_id
    }

    /// Returns the DSN this envelope is addressed to.
    pub fn dsn(&self) -> Option<&Dsn> {
        self.headers.dsn.as_ref()
    }

    /// Sets the DSN this envelope is addressed to.
    pub fn set_dsn(&mut self, dsn: Dsn) {
        self.headers.dsn = Some(dsn);
    }

    /// Returns the time at which the envelope was sent.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.headers.sent_at
    }

    /// Sets the timestamp at which the envelope is sent.
    pub fn set_sent_at(&mut self, sent_at: DateTime<Utc>) {
        self.headers.sent_at = Some(sent_at);
    }

    /// Sets the specified header value, returning the previous one if present.
    pub fn set_header<S, V>(&mut self, name: S, value: V) -> Option<Value>
    where
        S: Into<String>,
        V: Into<Value>,
    {
        self.headers.other.insert(name.into(), value.into())
    }

    /// Returns an iterator over items in this envelope.
    pub fn items(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }

    /// Returns the first item that matches the given condition.
    pub fn get_item_by<F>(&self, mut pred: F) -> Option<&Item>
    where
        F: FnMut(&Item) -> bool,
    {
        self.items().find(|item| pred(item))
    }

    /// Adds a new item to this envelope.
    pub fn add_item(&mut self, item: Item) {
        self.items.push(item)
    }

    /// Removes and returns all items matching the predicate.
    pub fn take_items_by<F>(&mut self, mut cond: F) -> Items
    where
        F: FnMut(&Item) -> bool,
    {
        let (taken, retained): (Items, Items) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| cond(item));

        self.items = retained;
        taken
    }

    /// Serializes this envelope into the given writer.
    pub fn serialize<W>(&self, mut writer: W) -> Result<(), EnvelopeError>
    where
        W: Write,
    {
        serde_json::to_writer(&mut writer, &self.headers).map_err(EnvelopeError::HeaderIoFailed)?;
        self.write(&mut writer, b"\n")?;

        for item in &self.items {
            serde_json::to_writer(&mut writer, &item.headers)
                .map_err(EnvelopeError::HeaderIoFailed)?;
            self.write(&mut writer, b"\n")?;

            self.write(&mut writer, &item.payload)?;
            self.write(&mut writer, b"\n")?;
        }

        Ok(())
    }

    /// Serializes this envelope into a buffer.
    pub fn to_vec(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut vec = Vec::new();
        self.serialize(&mut vec)?;
        Ok(vec)
    }

    fn parse_headers(slice: &[u8]) -> Result<(EnvelopeHeaders, usize), EnvelopeError> {
        let mut stream = serde_json::Deserializer::from_slice(slice).into_iter();

        let headers = match stream.next() {
            None => return Err(EnvelopeError::MissingHeader),
            Some(Err(error)) => return Err(EnvelopeError::InvalidHeader(error)),
            Some(Ok(headers)) => headers,
        };

        // Each header is terminated by a UNIX newline.
        require_termination(slice, stream.byte_offset())?;

        Ok((headers, stream.byte_offset() + 1))
    }

    fn parse_items(bytes: &Bytes, mut offset: usize) -> Result<Items, EnvelopeError> {
        let mut items = Items::new();

        while offset < bytes.len() {
            let (item, item_size) = Item::parse(bytes.slice(offset..))?;
            offset += item_size;
            items.push(item);
        }

        Ok(items)
    }

    fn write<W>(&self, mut writer: W, buf: &[u8]) -> Result<(), EnvelopeError>
    where
        W: Write,
    {
        writer
            .write_all(buf)
            .map_err(EnvelopeError::PayloadIoFailed)
    }
}

fn require_termination(slice: &[u8], offset: usize) -> Result<(), EnvelopeError> {
    match slice.get(offset) {
        Some(&b'\n') | None => Ok(()),
        Some(_) => Err(EnvelopeError::MissingNewline),
    }
}
