//! Common functionality for the Beacon delivery pipeline.
#![warn(missing_docs)]

mod backoff;
pub mod time;

pub use crate::backoff::*;
