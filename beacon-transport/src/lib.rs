//! Delivery pipeline for envelopes.
//!
//! Envelopes handed to an [`AsyncConnection`](connection::AsyncConnection) pass through these
//! stages:
//!
//!  1. The [`RateLimiter`](utils::RateLimiter) removes items of categories the server asked the
//!     client to back off from.
//!  2. The remaining envelope is queued on a bounded
//!     [`RetryingExecutor`](beacon_threading::RetryingExecutor).
//!  3. Before each attempt, pending loss counts from the
//!     [`ClientReportRecorder`](client_reports::ClientReportRecorder) are attached as a
//!     `client_report` item.
//!  4. The [`Transport`](http::Transport) sends the envelope. Rate limit headers in the response
//!     update the shared [`RateLimits`](beacon_quotas::RateLimits).
//!
//! Every envelope item that does not reach the server is either counted in a client report or
//! kept in the [`EnvelopeCache`](cache::EnvelopeCache) for a later attempt.

#![warn(missing_docs)]

pub mod cache;
pub mod client_reports;
pub mod connection;
pub mod envelope;
pub mod gate;
pub mod hint;
pub mod http;
pub mod utils;

#[cfg(test)]
mod testutils;
