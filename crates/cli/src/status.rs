// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomically-published `status.json` snapshot.
//!
//! Agents poll this document to infer daemon liveness and target
//! activity. Every write goes through a same-directory temp file plus
//! rename, so a reader never observes a partial document. Readers must
//! tolerate additional keys.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ports::Clock;

/// Serial port connection states, as surfaced to agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived target health shown in `status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Idle,
    Stuck,
    Degraded,
    Disconnected,
}

// -- Snapshot schema ----------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    pub id: String,
    pub started: Option<DateTime<Utc>>,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSection {
    pub port: String,
    pub baud: u32,
    pub status: ConnectionState,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterSection {
    pub lines_logged: u64,
    pub bytes_received: u64,
    pub commands_sent: u64,
    pub alerts_triggered: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSection {
    pub last_activity: Option<DateTime<Utc>>,
    pub idle_seconds: i64,
    pub bytes_last_minute: u64,
    pub read_errors: u64,
    pub usb_disconnects: u64,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResetSection {
    pub last_reason: Option<String>,
    pub last_time: Option<DateTime<Utc>>,
    pub history: HashMap<String, u64>,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSection {
    pub enabled: bool,
    pub active: bool,
    pub mode: String,
    pub chunk_size: usize,
    pub marker: Option<String>,
    pub pattern_matching: bool,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            enabled: false,
            active: false,
            mode: "raw".to_owned(),
            chunk_size: 0,
            marker: None,
            pattern_matching: true,
        }
    }
}

/// The complete document written to `status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub session: SessionSection,
    pub connection: ConnectionSection,
    pub counters: CounterSection,
    pub health: HealthSection,
    pub patterns: HashMap<String, u64>,
    pub resets: ResetSection,
    pub stream: StreamSection,
    pub last_updated: DateTime<Utc>,
}

// -- Manager ------------------------------------------------------------------

pub struct StatusManager {
    clock: Arc<dyn Clock>,
    status_path: PathBuf,

    session_id: String,
    started: Option<DateTime<Utc>>,
    port: String,
    baud: u32,
    state: ConnectionState,
    cold_start: bool,

    reconnects: u64,
    lines_logged: u64,
    bytes_received: u64,
    commands_sent: u64,
    alerts_triggered: u64,
    pattern_counts: HashMap<String, u64>,

    last_activity: Option<DateTime<Utc>>,
    bytes_last_minute: u64,
    minute_start: Option<DateTime<Utc>>,
    read_errors: u64,
    usb_disconnects: u64,

    resets: ResetSection,
    stream: StreamSection,
}

impl StatusManager {
    pub fn new(clock: Arc<dyn Clock>, status_path: &Path) -> Self {
        Self {
            clock,
            status_path: status_path.to_owned(),
            session_id: String::new(),
            started: None,
            port: String::new(),
            baud: 0,
            state: ConnectionState::Disconnected,
            cold_start: false,
            reconnects: 0,
            lines_logged: 0,
            bytes_received: 0,
            commands_sent: 0,
            alerts_triggered: 0,
            pattern_counts: HashMap::new(),
            last_activity: None,
            bytes_last_minute: 0,
            minute_start: None,
            read_errors: 0,
            usb_disconnects: 0,
            resets: ResetSection::default(),
            stream: StreamSection::default(),
        }
    }

    /// Begin tracking a session; all counters reset.
    pub fn start_session(&mut self, session_id: &str, port: &str, baud: u32) {
        self.session_id = session_id.to_owned();
        self.port = port.to_owned();
        self.baud = baud;
        self.started = Some(self.clock.now());
        self.state = ConnectionState::Connecting;
        self.reconnects = 0;
        self.lines_logged = 0;
        self.bytes_received = 0;
        self.commands_sent = 0;
        self.alerts_triggered = 0;
        self.pattern_counts.clear();
        self.update();
    }

    /// While set, derived health is pinned to `starting`.
    pub fn set_cold_start(&mut self, cold: bool) {
        self.cold_start = cold;
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.update();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_port(&mut self, port: &str) {
        self.port = port.to_owned();
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
        self.update();
    }

    pub fn record_line(&mut self) {
        self.lines_logged += 1;
    }

    pub fn record_bytes(&mut self, count: u64) {
        self.bytes_received += count;
    }

    pub fn record_command(&mut self) {
        self.commands_sent += 1;
    }

    pub fn record_alert(&mut self, pattern: &str) {
        self.alerts_triggered += 1;
        *self.pattern_counts.entry(pattern.to_owned()).or_insert(0) += 1;
    }

    /// Record serial activity for idle/throughput tracking.
    pub fn record_activity(&mut self, byte_count: u64) {
        let now = self.clock.now();
        self.last_activity = Some(now);

        match self.minute_start {
            None => {
                self.minute_start = Some(now);
                self.bytes_last_minute = byte_count;
            }
            Some(start) if (now - start).num_seconds() >= 60 => {
                self.minute_start = Some(now);
                self.bytes_last_minute = byte_count;
            }
            Some(_) => self.bytes_last_minute += byte_count,
        }
    }

    /// Serial I/O failures (failed reads or writes on the open handle).
    pub fn record_io_error(&mut self) {
        self.read_errors += 1;
        self.update();
    }

    pub fn record_usb_disconnect(&mut self) {
        self.usb_disconnects += 1;
        self.update();
    }

    pub fn set_reset_statistics(&mut self, resets: ResetSection) {
        self.resets = resets;
    }

    pub fn set_stream_state(&mut self, stream: StreamSection) {
        self.stream = stream;
        self.update();
    }

    /// Build the current snapshot without writing it.
    pub fn snapshot(&self) -> StatusSnapshot {
        let now = self.clock.now();
        let uptime = self.started.map(|s| (now - s).num_seconds().max(0)).unwrap_or(0);
        let idle_seconds = match self.last_activity {
            Some(at) => (now - at).num_seconds().max(0),
            None => uptime,
        };

        StatusSnapshot {
            session: SessionSection {
                id: self.session_id.clone(),
                started: self.started,
                uptime_seconds: uptime,
            },
            connection: ConnectionSection {
                port: self.port.clone(),
                baud: self.baud,
                status: self.state,
                reconnects: self.reconnects,
            },
            counters: CounterSection {
                lines_logged: self.lines_logged,
                bytes_received: self.bytes_received,
                commands_sent: self.commands_sent,
                alerts_triggered: self.alerts_triggered,
            },
            health: HealthSection {
                last_activity: self.last_activity,
                idle_seconds,
                bytes_last_minute: self.bytes_last_minute,
                read_errors: self.read_errors,
                usb_disconnects: self.usb_disconnects,
                status: self.derive_health(idle_seconds),
            },
            patterns: self.pattern_counts.clone(),
            resets: self.resets.clone(),
            stream: self.stream.clone(),
            last_updated: now,
        }
    }

    /// Publish the snapshot atomically.
    pub fn update(&mut self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.write_atomic(&snapshot) {
            warn!("could not write status.json: {e}");
        }
    }

    fn derive_health(&self, idle_seconds: i64) -> HealthStatus {
        if self.cold_start {
            return HealthStatus::Starting;
        }
        if self.state == ConnectionState::Disconnected {
            return HealthStatus::Disconnected;
        }
        if idle_seconds > 30 {
            return HealthStatus::Stuck;
        }
        if idle_seconds > 10 {
            return HealthStatus::Idle;
        }
        if self.read_errors > 10 {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }

    fn write_atomic(&self, snapshot: &StatusSnapshot) -> anyhow::Result<()> {
        let dir = self.status_path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix("status_")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(snapshot)?.as_bytes())?;
        tmp.persist(&self.status_path)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
