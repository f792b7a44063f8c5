//! Durability cache for envelopes that could not be delivered yet.
//!
//! The [`DiskEnvelopeCache`] keeps one file per envelope in a directory:
//!
//!  - `<event_id>.envelope` for regular envelopes. At most `max_items` of these are kept; when the
//!    cache is full, the oldest file is removed and its items are recorded as `cache_overflow`.
//!  - `crash-<event_id>.envelope` for envelopes containing a crash. These are exempt from rotation
//!    and listed first, so crashes are delivered before anything else on the next start.
//!  - `last_crash` holds the time of the most recent crash until it is taken.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use beacon_base_schema::{DiscardReason, EventId};
use beacon_common::time::DateProvider;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::client_reports::ClientReportRecorder;
use crate::envelope::Envelope;
use crate::hint::Hint;

/// File extension of cached envelopes.
const ENVELOPE_EXTENSION: &str = "envelope";

/// File name prefix of cached crash envelopes.
const CRASH_PREFIX: &str = "crash-";

/// Name of the marker file written for crashes.
const CRASH_MARKER_FILE: &str = "last_crash";

/// Storage for envelopes that are retried later.
pub trait EnvelopeCache: Send + Sync {
    /// Persists an envelope.
    ///
    /// Returns `true` if a copy of the envelope is stored after this call, including when the
    /// envelope had been stored before.
    fn store(&self, envelope: &Envelope, hint: &Hint) -> bool;

    /// Removes the stored copy of an envelope, if any.
    fn discard(&self, event_id: EventId);

    /// Returns all stored envelopes in the order they should be sent.
    fn list(&self) -> Vec<Box<Envelope>>;
}

/// A cache that stores nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpEnvelopeCache;

impl EnvelopeCache for NoOpEnvelopeCache {
    fn store(&self, _envelope: &Envelope, _hint: &Hint) -> bool {
        false
    }

    fn discard(&self, _event_id: EventId) {}

    fn list(&self) -> Vec<Box<Envelope>> {
        Vec::new()
    }
}

/// An [`EnvelopeCache`] that writes envelopes into a directory.
pub struct DiskEnvelopeCache {
    dir: PathBuf,
    max_items: usize,
    recorder: Arc<ClientReportRecorder>,
    date_provider: Arc<dyn DateProvider>,
    lock: Mutex<()>,
}

impl DiskEnvelopeCache {
    /// Opens the cache in `dir`, creating the directory if necessary.
    pub fn new(
        dir: impl Into<PathBuf>,
        max_items: usize,
        recorder: Arc<ClientReportRecorder>,
        date_provider: Arc<dyn DateProvider>,
    ) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            max_items: max_items.max(1),
            recorder,
            date_provider,
            lock: Mutex::new(()),
        })
    }

    /// Returns the cache directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the time of the last cached crash and removes the marker.
    pub fn take_crash_marker(&self) -> Option<DateTime<Utc>> {
        let path = self.dir.join(CRASH_MARKER_FILE);
        let _guard = self.lock.lock();

        let contents = fs::read_to_string(&path).ok()?;
        if let Err(error) = fs::remove_file(&path) {
            beacon_log::error!(
                error = &error as &dyn std::error::Error,
                "failed to remove crash marker"
            );
        }

        match DateTime::parse_from_rfc3339(contents.trim()) {
            Ok(timestamp) => Some(timestamp.with_timezone(&Utc)),
            Err(_) => {
                beacon_log::warn!("discarding invalid crash marker");
                None
            }
        }
    }

    fn envelope_path(&self, event_id: EventId) -> PathBuf {
        self.dir.join(format!("{event_id}.{ENVELOPE_EXTENSION}"))
    }

    fn crash_path(&self, event_id: EventId) -> PathBuf {
        self.dir
            .join(format!("{CRASH_PREFIX}{event_id}.{ENVELOPE_EXTENSION}"))
    }

    /// Returns cached files with their kind and modification time, oldest first.
    fn entries(&self) -> Vec<CacheEntry> {
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => read_dir,
            Err(error) => {
                beacon_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to read cache directory"
                );
                return Vec::new();
            }
        };

        let mut entries: Vec<_> = read_dir
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(ENVELOPE_EXTENSION) {
                    return None;
                }

                let crash = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(CRASH_PREFIX));
                let modified = entry
                    .metadata()
                    .and_then(|metadata| metadata.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);

                Some(CacheEntry {
                    path,
                    crash,
                    modified,
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.crash
                .cmp(&a.crash)
                .then(a.modified.cmp(&b.modified))
                .then_with(|| a.path.cmp(&b.path))
        });
        entries
    }

    /// Removes the oldest regular envelopes until there is room for one more.
    fn rotate(&self) {
        let regular: Vec<_> = self
            .entries()
            .into_iter()
            .filter(|entry| !entry.crash)
            .collect();

        if regular.len() < self.max_items {
            return;
        }

        let excess = regular.len() + 1 - self.max_items;
        for entry in regular.into_iter().take(excess) {
            match read_envelope(&entry.path) {
                Ok(envelope) => {
                    beacon_log::warn!(
                        event_id = %envelope.event_id(),
                        "cache is full, dropping oldest envelope"
                    );
                    self.recorder
                        .record_lost_envelope(DiscardReason::CacheOverflow, &envelope);
                }
                Err(error) => {
                    beacon_log::error!(
                        error = &error as &dyn std::error::Error,
                        "failed to read rotated envelope"
                    );
                }
            }

            remove_file(&entry.path);
        }
    }

    fn write_crash_marker(&self) -> io::Result<()> {
        let now = self.date_provider.now().to_rfc3339();
        write_atomic(&self.dir.join(CRASH_MARKER_FILE), now.as_bytes())
    }
}

impl EnvelopeCache for DiskEnvelopeCache {
    fn store(&self, envelope: &Envelope, hint: &Hint) -> bool {
        let event_id = envelope.event_id();
        let _guard = self.lock.lock();

        if self.envelope_path(event_id).exists() || self.crash_path(event_id).exists() {
            return true;
        }

        let path = if hint.is_crash() {
            self.crash_path(event_id)
        } else {
            self.rotate();
            self.envelope_path(event_id)
        };

        let result = envelope
            .to_vec()
            .map_err(io::Error::other)
            .and_then(|bytes| write_atomic(&path, &bytes));

        if let Err(error) = result {
            beacon_log::error!(
                error = &error as &dyn std::error::Error,
                %event_id,
                "failed to store envelope in cache"
            );
            return false;
        }

        if hint.is_crash() {
            if let Err(error) = self.write_crash_marker() {
                beacon_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to write crash marker"
                );
            }
        }

        beacon_log::trace!(%event_id, "envelope stored in cache");
        true
    }

    fn discard(&self, event_id: EventId) {
        let _guard = self.lock.lock();

        for path in [self.envelope_path(event_id), self.crash_path(event_id)] {
            if path.exists() {
                remove_file(&path);
                beacon_log::trace!(%event_id, "envelope removed from cache");
            }
        }
    }

    fn list(&self) -> Vec<Box<Envelope>> {
        let _guard = self.lock.lock();
        let mut envelopes = Vec::new();

        for entry in self.entries() {
            match read_envelope(&entry.path) {
                Ok(envelope) => envelopes.push(envelope),
                Err(error) => {
                    beacon_log::error!(
                        error = &error as &dyn std::error::Error,
                        path = %entry.path.display(),
                        "discarding unreadable cached envelope"
                    );
                    remove_file(&entry.path);
                }
            }
        }

        envelopes
    }
}

impl fmt::Debug for DiskEnvelopeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskEnvelopeCache")
            .field("dir", &self.dir)
            .field("max_items", &self.max_items)
            .finish()
    }
}

struct CacheEntry {
    path: PathBuf,
    crash: bool,
    modified: SystemTime,
}

fn read_envelope(path: &Path) -> io::Result<Box<Envelope>> {
    let bytes = fs::read(path)?;
    Envelope::parse_bytes(Bytes::from(bytes)).map_err(io::Error::other)
}

/// Writes to a temporary file next to `path` and moves it into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

fn remove_file(path: &Path) {
    if let Err(error) = fs::remove_file(path) {
        beacon_log::error!(
            error = &error as &dyn std::error::Error,
            path = %path.display(),
            "failed to remove cached file"
        );
    }
}
