//! Basic types for the Beacon delivery pipeline.
//!
//! These types are shared by rate limiting, client reports and the transport, and are kept in a
//! leaf crate so that all of them agree on names and wire representations.

#![warn(missing_docs)]

mod data_category;
mod discard_reason;
mod events;

pub use self::data_category::*;
pub use self::discard_reason::*;
pub use self::events::*;
