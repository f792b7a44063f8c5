//! Sending envelopes to the server over HTTP.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use beacon_config::{Config, HttpEncoding};
use beacon_quotas::{RATE_LIMITS_HEADER, RETRY_AFTER_HEADER, RateLimits, RetryAfter};
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::header;
use sentry_types::Dsn;

use crate::envelope::{Envelope, EnvelopeError};

/// The content type of serialized envelopes.
pub const ENVELOPE_CONTENT_TYPE: &str = "application/x-sentry-envelope";

/// The header carrying client authentication.
pub const AUTH_HEADER: &str = "X-Sentry-Auth";

/// The protocol version announced in the authentication header.
const PROTOCOL_VERSION: u16 = 7;

/// The client identifier sent with every request.
pub const CLIENT_NAME: &str = concat!("beacon/", env!("CARGO_PKG_VERSION"));

/// Outcome of a single delivery attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportResult {
    /// The server accepted the envelope.
    Success,
    /// The server answered with `429 Too Many Requests`.
    RateLimited {
        /// The delay requested by the `Retry-After` header.
        retry_after: Option<Duration>,
    },
    /// The attempt failed in a way that may succeed later.
    ///
    /// This covers network errors, where `status` is `None`, and server errors.
    Retryable {
        /// The HTTP status code, if a response was received.
        status: Option<u16>,
        /// The delay requested by the `Retry-After` header.
        retry_after: Option<Duration>,
    },
    /// The envelope can never be delivered.
    ///
    /// This covers client errors and envelopes that cannot be encoded.
    Rejected {
        /// The HTTP status code, if a response was received.
        status: Option<u16>,
    },
}

impl TransportResult {
    /// Classifies a response status code.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            200..=299 => Self::Success,
            429 => Self::RateLimited { retry_after },
            400..=499 => Self::Rejected {
                status: Some(status),
            },
            _ => Self::Retryable {
                status: Some(status),
                retry_after,
            },
        }
    }

    /// Returns `true` if the envelope was delivered.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns the HTTP status code of the response, if any.
    pub fn status(&self) -> Option<u16> {
        match *self {
            Self::Success => Some(200),
            Self::RateLimited { .. } => Some(429),
            Self::Retryable { status, .. } | Self::Rejected { status } => status,
        }
    }
}

/// Delivers envelopes to the server.
///
/// Implementations are responsible for updating the shared [`RateLimits`] from the server's
/// response. They never retry on their own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Makes a single attempt to deliver the envelope.
    async fn send(&self, envelope: &Envelope) -> TransportResult;
}

/// An error raised while sending an envelope over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// No DSN is configured.
    #[error("attempted to create an HTTP transport without a DSN configured")]
    NoCredentials,
    /// The request could not be sent or the response could not be read.
    #[error("could not send request")]
    Reqwest(#[from] reqwest::Error),
    /// Compressing the payload failed.
    #[error("failed to encode payload")]
    Io(#[from] io::Error),
    /// Serializing the envelope failed.
    #[error("failed to serialize envelope")]
    Envelope(#[from] EnvelopeError),
}

impl HttpError {
    /// Returns `true` if the error indicates a network downtime.
    pub fn is_network_error(&self) -> bool {
        match self {
            Self::Reqwest(error) => !error.is_builder(),
            Self::NoCredentials | Self::Io(_) | Self::Envelope(_) => false,
        }
    }
}

/// A [`Transport`] that posts envelopes to the envelope endpoint of the configured DSN.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    auth: String,
    encoding: HttpEncoding,
    rate_limits: Arc<RateLimits>,
}

impl HttpTransport {
    /// Creates a transport for the DSN in `config`.
    ///
    /// The transport writes server rate limits into `rate_limits`, which is shared with the rate
    /// limiter of the connection.
    pub fn new(config: &Config, rate_limits: Arc<RateLimits>) -> Result<Self, HttpError> {
        let dsn = config.dsn().ok_or(HttpError::NoCredentials)?;

        let client = reqwest::ClientBuilder::new()
            .connect_timeout(config.http_connection_timeout())
            .timeout(config.http_timeout())
            .user_agent(CLIENT_NAME)
            .build()?;

        Ok(Self {
            client,
            endpoint: dsn.envelope_api_url().to_string(),
            auth: auth_header(dsn),
            encoding: config.http_encoding(),
            rate_limits,
        })
    }

    /// Returns the URL envelopes are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn try_send(&self, envelope: &Envelope) -> Result<TransportResult, HttpError> {
        let body = encode_payload(envelope.to_vec()?, self.encoding)?;

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, ENVELOPE_CONTENT_TYPE)
            .header(AUTH_HEADER, &self.auth);

        if let Some(name) = self.encoding.name() {
            request = request.header(header::CONTENT_ENCODING, name);
        }

        let response = request.body(body).send().await?;
        let status = response.status().as_u16();

        let rate_limits = header_value(&response, RATE_LIMITS_HEADER);
        let retry_after = header_value(&response, RETRY_AFTER_HEADER);
        self.rate_limits
            .update_retry_after_limits(rate_limits, retry_after, status);

        let retry_after = retry_after
            .and_then(|value| value.trim().parse::<RetryAfter>().ok())
            .map(RetryAfter::delay);

        Ok(TransportResult::from_status(status, retry_after))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: &Envelope) -> TransportResult {
        match self.try_send(envelope).await {
            Ok(result) => {
                beacon_log::trace!(
                    event_id = %envelope.event_id(),
                    ?result,
                    "envelope request finished"
                );
                result
            }
            Err(error) if error.is_network_error() => {
                beacon_log::warn!(
                    error = &error as &dyn std::error::Error,
                    event_id = %envelope.event_id(),
                    "failed to send envelope"
                );
                TransportResult::Retryable {
                    status: None,
                    retry_after: None,
                }
            }
            Err(error) => {
                beacon_log::error!(
                    error = &error as &dyn std::error::Error,
                    event_id = %envelope.event_id(),
                    "failed to prepare envelope request"
                );
                TransportResult::Rejected { status: None }
            }
        }
    }
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .field("encoding", &self.encoding)
            .finish()
    }
}

fn auth_header(dsn: &Dsn) -> String {
    let mut auth = format!(
        "Sentry sentry_version={PROTOCOL_VERSION}, sentry_client={CLIENT_NAME}, sentry_key={}",
        dsn.public_key()
    );

    if let Some(secret) = dsn.secret_key() {
        auth.push_str(", sentry_secret=");
        auth.push_str(secret);
    }

    auth
}

fn header_value<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name)?.to_str().ok()
}

fn encode_payload(body: Vec<u8>, encoding: HttpEncoding) -> Result<Vec<u8>, io::Error> {
    match encoding {
        HttpEncoding::Identity => Ok(body),
        HttpEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&body)?;
            encoder.finish()
        }
    }
}
