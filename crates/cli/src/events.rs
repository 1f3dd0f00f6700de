// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Append-only JSONL event stream with monotonic sequence numbers.
//!
//! Agents tail `events.jsonl`; the daemon and the fault-analysis worker
//! both append through a shared emitter. Sequence allocation is a
//! process-wide atomic and each record is written as a single flock'd
//! append, so sequences are strictly increasing across writers. On
//! construction the last sequence is recovered from the file tail, so
//! restarts continue the numbering.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ports::Clock;

/// How far back the tail scan looks for the last well-formed record.
const TAIL_SCAN_BYTES: u64 = 4096;

/// Severity attached to each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One record in `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub schema_version: u32,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub level: EventLevel,
    pub session_id: Option<String>,
    pub data: serde_json::Value,
}

pub struct EventEmitter {
    clock: Arc<dyn Clock>,
    events_path: PathBuf,
    sequence: AtomicU64,
    session_id: RwLock<Option<String>>,
}

impl EventEmitter {
    pub fn new(clock: Arc<dyn Clock>, events_path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = events_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let last = load_last_sequence(events_path);
        Ok(Self {
            clock,
            events_path: events_path.to_owned(),
            sequence: AtomicU64::new(last),
            session_id: RwLock::new(None),
        })
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.write() = Some(session_id.to_owned());
    }

    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Append one event; returns the record that was written.
    ///
    /// The sequence number is allocated while the file lock is held, so
    /// concurrent writers (daemon loop + analyzer worker) land in the
    /// file in sequence order, one line-atomic write each.
    pub fn emit(
        &self,
        event_type: &str,
        level: EventLevel,
        data: serde_json::Value,
    ) -> EventRecord {
        let locked = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .map_err(anyhow::Error::from)
            .and_then(|file| {
                Flock::lock(file, FlockArg::LockExclusive)
                    .map_err(|(_f, errno)| anyhow::anyhow!("flock failed: {errno}"))
            });

        let record = EventRecord {
            schema_version: 1,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: self.clock.now(),
            event_type: event_type.to_owned(),
            level,
            session_id: self.session_id.read().clone(),
            data,
        };

        let written = locked.and_then(|mut locked| {
            let mut line = serde_json::to_string(&record)?;
            line.push('\n');
            locked.write_all(line.as_bytes())?;
            locked.flush()?;
            Ok(())
        });
        if let Err(e) = written {
            warn!("could not append event {}: {e}", record.event_type);
        }
        record
    }

    /// Shorthand for an info-level event.
    pub fn info(&self, event_type: &str, data: serde_json::Value) -> EventRecord {
        self.emit(event_type, EventLevel::Info, data)
    }
}

/// Recover the last sequence number from the tail of the file.
///
/// Reads the final 4 KiB, splits into lines, and takes the sequence of the
/// last JSON-parseable one. Anything unreadable yields 0.
fn load_last_sequence(path: &Path) -> u64 {
    let Ok(mut file) = std::fs::File::open(path) else {
        return 0;
    };
    let Ok(size) = file.seek(SeekFrom::End(0)) else {
        return 0;
    };
    if size == 0 {
        return 0;
    }

    let offset = size.min(TAIL_SCAN_BYTES);
    if file.seek(SeekFrom::End(-(offset as i64))).is_err() {
        return 0;
    }
    let mut tail = Vec::with_capacity(offset as usize);
    if file.read_to_end(&mut tail).is_err() {
        return 0;
    }

    let text = String::from_utf8_lossy(&tail);
    text.lines()
        .rev()
        .find_map(|line| serde_json::from_str::<EventRecord>(line).ok())
        .map(|record| record.sequence)
        .unwrap_or(0)
}

/// Parse every well-formed record in an events file, in file order.
/// Intended for tests and operator tooling, not the hot path.
pub fn read_events(path: &Path) -> Vec<EventRecord> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
