//! Configuration for the Beacon delivery pipeline.
//!
//! The configuration is loaded from a `config.yml` file in a configuration directory with
//! [`Config::from_path`]. All sections and keys are optional and fall back to defaults.
//!
//! ```yaml
//! client:
//!   dsn: https://public@sentry.example.com/42
//!   environment: production
//! queue:
//!   max_queue_size: 100
//! cache:
//!   dir: /var/lib/myapp/envelopes
//! ```

#![warn(missing_docs)]

mod config;

pub use self::config::*;
