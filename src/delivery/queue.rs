//! Ordered, thread-safe queue of events awaiting delivery.
//!
//! The backing storage is never exposed: callers only enqueue, flush into a
//! sink, or drain. The lock is held for the read-modify-write of the sequence
//! and released before any event is handed to the sink, so slow network I/O
//! never stalls enqueueing callers.
//!
//! With a spool path configured the queue mirrors its contents to a file of
//! JSON lines so offline telemetry survives a process restart. Enqueueing
//! appends one line. Flushes, drains and restores rewrite the file, as does
//! opening it; those paths already walk the whole queue. A torn trailing line
//! from a crash is skipped on load.

use crate::delivery::event::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("spool {path}: cannot encode event: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Events the sink accepted.
    pub delivered: usize,
    /// Events put back after a sink failure.
    pub requeued: usize,
}

#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: Mutex<VecDeque<Event>>,
    spool: Option<Spool>,
}

impl OutboundQueue {
    /// In-memory queue with no spool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue mirrored to `path`; existing spooled events are loaded first.
    pub fn with_spool(path: impl Into<PathBuf>) -> Self {
        let spool = Spool { path: path.into() };
        let entries = match spool.load() {
            Ok((events, skipped)) => {
                if skipped > 0 {
                    warn!(skipped, path = %spool.path.display(), "skipped unreadable spool lines");
                }
                if !events.is_empty() {
                    info!(
                        count = events.len(),
                        path = %spool.path.display(),
                        "restored queued events from spool"
                    );
                }
                events
            }
            Err(err) => {
                warn!("ignoring unreadable spool: {err}");
                VecDeque::new()
            }
        };
        if let Err(err) = spool.store(&entries) {
            warn!("failed to compact spool: {err}");
        }
        Self {
            entries: Mutex::new(entries),
            spool: Some(spool),
        }
    }

    /// Append an event. Never rejects.
    pub fn enqueue(&self, event: Event) {
        let mut entries = self.entries.lock();
        if let Some(spool) = &self.spool {
            if let Err(err) = spool.append(&event) {
                warn!("failed to append to spool: {err}");
            }
        }
        entries.push_back(event);
        let depth = entries.len();
        drop(entries);
        debug!(depth, "event queued");
    }

    /// Swap out everything queued, then hand each event to `deliver` in order.
    ///
    /// When `deliver` fails, the failing event and every event after it are
    /// put back at the front of the live queue, ahead of anything enqueued
    /// while the flush was running.
    pub fn flush<F, E>(&self, mut deliver: F) -> FlushReport
    where
        F: FnMut(&Event) -> Result<(), E>,
        E: fmt::Display,
    {
        let batch: Vec<Event> = {
            let mut entries = self.entries.lock();
            let batch = entries.drain(..).collect();
            self.persist(&entries);
            batch
        };
        if batch.is_empty() {
            return FlushReport::default();
        }

        let total = batch.len();
        let mut delivered = 0;
        for event in &batch {
            if let Err(err) = deliver(event) {
                warn!(
                    delivered,
                    remaining = total - delivered,
                    "delivery failed during flush: {err}"
                );
                break;
            }
            delivered += 1;
        }

        let requeued = total - delivered;
        if requeued > 0 {
            self.restore_front(batch.into_iter().skip(delivered).collect());
        }
        debug!(delivered, requeued, "flush finished");
        FlushReport {
            delivered,
            requeued,
        }
    }

    /// Discard the whole queue, returning what was dropped.
    pub fn drain_all(&self) -> Vec<Event> {
        let mut entries = self.entries.lock();
        let drained: Vec<Event> = entries.drain(..).collect();
        self.persist(&entries);
        drained
    }

    /// Put events back at the head of the queue, keeping their order.
    pub(crate) fn restore_front(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        for event in events.into_iter().rev() {
            entries.push_front(event);
        }
        self.persist(&entries);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the current contents, head first.
    pub fn snapshot(&self) -> Vec<Event> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn spool_path(&self) -> Option<&Path> {
        self.spool.as_ref().map(|s| s.path.as_path())
    }

    fn persist(&self, entries: &VecDeque<Event>) {
        if let Some(spool) = &self.spool {
            if let Err(err) = spool.store(entries) {
                warn!("failed to write spool: {err}");
            }
        }
    }
}

// -----------------------------------------------------------------------------
// Spool file
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Spool {
    path: PathBuf,
}

impl Spool {
    /// Events in file order, plus the number of lines that failed to parse.
    fn load(&self) -> Result<(VecDeque<Event>, usize), SpoolError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok((VecDeque::new(), 0))
            }
            Err(source) => {
                return Err(SpoolError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let mut events = VecDeque::new();
        let mut skipped = 0;
        for line in data.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(event) => events.push_back(event),
                Err(_) => skipped += 1,
            }
        }
        Ok((events, skipped))
    }

    fn append(&self, event: &Event) -> Result<(), SpoolError> {
        let mut line = self.encode(event)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_err(source))?;
        file.write_all(&line).map_err(|source| self.io_err(source))
    }

    /// Rewrite the whole file atomically.
    fn store(&self, entries: &VecDeque<Event>) -> Result<(), SpoolError> {
        let io_err = |source| self.io_err(source);
        let mut body = Vec::new();
        for event in entries {
            body.extend(self.encode(event)?);
            body.push(b'\n');
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }

    fn encode(&self, event: &Event) -> Result<Vec<u8>, SpoolError> {
        serde_json::to_vec(event).map_err(|source| SpoolError::Encode {
            path: self.path.clone(),
            source,
        })
    }

    fn io_err(&self, source: std::io::Error) -> SpoolError {
        SpoolError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
