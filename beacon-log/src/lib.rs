//! Logging facade for the Beacon delivery pipeline.
//!
//! # Setup
//!
//! To enable logging, invoke the [`init`] function with a [`LogConfig`]. The configuration
//! implements `serde` traits, so it can be obtained from configuration files. Setup requires the
//! `init` feature.
//!
//! ```ignore
//! use beacon_log::LogConfig;
//!
//! let log_config = LogConfig {
//!     enable_backtraces: true,
//!     ..LogConfig::default()
//! };
//!
//! beacon_log::init(&log_config);
//! ```
//!
//! # Logging
//!
//! The basic use of the log crate is through the five logging macros: [`error!`], [`warn!`],
//! [`info!`], [`debug!`] and [`trace!`] where `error!` represents the highest-priority log messages
//! and `trace!` the lowest. The log messages are filtered by configuring the log level to exclude
//! messages with a lower priority. Each of these macros accept format strings similarly to
//! [`println!`].
//!
//! ## Conventions
//!
//! Log messages should start lowercase and end without punctuation. Prefer short and precise log
//! messages over verbose text. Choose the log level according to these rules:
//!
//! - [`error!`] for bugs and internal failures, such as an item of unknown type or a failed cache
//!   write.
//! - [`warn!`] for data that is dropped, rate limited envelopes and flushes that time out.
//! - [`info!`] for lifecycle messages.
//! - [`debug!`] for messages usually relevant to debugging.
//! - [`trace!`] for the flow of individual envelopes.
//!
//! ## Logging Error Types
//!
//! Errors are attached to log messages as structured fields. To print an error with all its
//! causes into the message itself, use the [`LogError`] wrapper.
//!
//! ```
//! use std::error::Error;
//! use std::io;
//! use beacon_log::LogError;
//!
//! let custom_error = io::Error::other("oh no!");
//! beacon_log::error!(error = &custom_error as &dyn Error, "operation failed");
//! beacon_log::error!("operation failed: {}", LogError(&custom_error));
//! ```
//!
//! # Testing
//!
//! For unit testing, there is a separate initialization macro [`init_test!`] that should be called
//! at the beginning of test method. It enables test mode of the logger and customizes log levels
//! for the current crate. This requires the `test` feature.
//!
//! ```ignore
//! #[test]
//! fn test_something() {
//!     beacon_log::init_test!();
//! }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod utils;
pub use utils::*;

// Expose the minimal log facade.
#[doc(inline)]
pub use tracing::{debug, enabled, error, event, info, trace, warn};
