//! Client for capturing errors, transactions and other telemetry.
//!
//! The [`Client`] turns protocol payloads into envelopes and hands them to the delivery pipeline
//! of [`beacon_transport`]. Before an event is queued, it runs through the event processors,
//! sampling and the `before_send` hooks in that order. Data dropped at any stage is counted and
//! reported to the server with a later envelope.
//!
//! # Example
//!
//! ```no_run
//! use beacon::protocol::{Event, Level};
//! use beacon::Client;
//! use beacon_config::Config;
//! use beacon_transport::hint::Hint;
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let config = Config::from_json_value(serde_json::json!({
//!     "client": { "dsn": "https://public@sentry.example.com/1" },
//! }))
//! .unwrap();
//!
//! let client = Client::new(config, runtime.handle().clone()).unwrap();
//! client.capture_event(Event::message(Level::Error, "something broke"), Hint::new());
//! client.close(None);
//! ```

#![warn(missing_docs)]

mod client;
pub mod options;
pub mod protocol;

pub use self::client::*;
