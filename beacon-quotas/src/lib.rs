//! Rate limits signaled by the server.
//!
//! Every response to an envelope request can carry rate limits, either as an
//! `X-Sentry-Rate-Limits` header with per-category entries, or as a blanket `Retry-After` header
//! on HTTP 429. [`RateLimits`] keeps the resulting deadlines per [`DataCategory`] and answers
//! whether a category is currently limited.
//!
//! [`DataCategory`]: beacon_base_schema::DataCategory

#![warn(missing_docs)]

mod rate_limit;

pub use self::rate_limit::*;
