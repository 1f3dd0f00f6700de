// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serial connection state machine with exponential backoff.
//!
//! The daemon owns the serial handle; this module owns the policy.
//! Methods return outcome values the orchestrator matches on to update
//! status and emit events — no shared callbacks.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ports::SerialPort;
use crate::status::ConnectionState;

/// What happened during a per-tick connection check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickEvent {
    /// The device path vanished while we were connected.
    UsbDisconnected,
    /// The handle reported closed while we were connected.
    ConnectionLost,
    /// A reopen attempt succeeded.
    Reconnected { count: u64 },
}

/// Result of [`ReconnectionManager::check_and_reconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickResult {
    pub connected: bool,
    pub events: Vec<TickEvent>,
}

pub struct ReconnectionManager {
    port_name: String,
    baud: u32,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,

    state: ConnectionState,
    reconnect_count: u64,
    current_delay: Duration,
}

impl ReconnectionManager {
    /// `max_retries == 0` means retry forever (bounded by shutdown).
    pub fn new(port_name: &str, baud: u32, max_retries: u32) -> Self {
        let base_delay = Duration::from_secs(1);
        Self {
            port_name: port_name.to_owned(),
            baud,
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            state: ConnectionState::Disconnected,
            reconnect_count: 0,
            current_delay: base_delay,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Point the manager at a different device path (auto-detect after a
    /// pause can land on a re-enumerated port).
    pub fn set_port_name(&mut self, port_name: &str) {
        self.port_name = port_name.to_owned();
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Open the port, backing off between attempts.
    ///
    /// Returns false when retries are exhausted or shutdown fired.
    pub async fn connect(
        &mut self,
        serial: &mut dyn SerialPort,
        shutdown: &CancellationToken,
    ) -> bool {
        self.state = ConnectionState::Connecting;
        self.current_delay = self.base_delay;
        info!("connecting to {} at {} baud", self.port_name, self.baud);

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            match serial.open(&self.port_name, self.baud) {
                Ok(()) => {
                    self.state = ConnectionState::Connected;
                    self.current_delay = self.base_delay;
                    info!("connected to {}", self.port_name);
                    return true;
                }
                Err(e) => {
                    warn!("connection attempt {attempt} failed: {e}");
                }
            }

            if self.max_retries > 0 && attempt >= self.max_retries {
                self.state = ConnectionState::Error;
                warn!("failed to connect after {attempt} attempts");
                return false;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.state = ConnectionState::Disconnected;
                    return false;
                }
                _ = tokio::time::sleep(self.current_delay) => {}
            }

            self.current_delay = Duration::from_secs_f64(
                (self.current_delay.as_secs_f64() * self.backoff_factor)
                    .min(self.max_delay.as_secs_f64()),
            );
        }
    }

    /// Per-tick liveness check with a single reopen attempt.
    ///
    /// Detects USB disappearance proactively: a connected state whose
    /// device path no longer exists closes the handle and reports
    /// [`TickEvent::UsbDisconnected`]. Reopen is still attempted — on real
    /// hardware it fails fast, and it keeps the logic uniform on
    /// platforms where path existence is not meaningful.
    pub fn check_and_reconnect(&mut self, serial: &mut dyn SerialPort) -> TickResult {
        let mut events = Vec::new();

        if self.state == ConnectionState::Connected && !serial.port_exists(&self.port_name) {
            self.state = ConnectionState::Reconnecting;
            warn!("port {} disappeared (USB disconnected?)", self.port_name);
            if serial.is_open() {
                serial.close();
            }
            events.push(TickEvent::UsbDisconnected);
        }

        if serial.is_open() {
            return TickResult { connected: true, events };
        }

        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Reconnecting;
            warn!("connection lost to {}", self.port_name);
            events.push(TickEvent::ConnectionLost);
        }

        match serial.open(&self.port_name, self.baud) {
            Ok(()) => {
                self.reconnect_count += 1;
                self.state = ConnectionState::Connected;
                self.current_delay = self.base_delay;
                info!("reconnected to {} (reconnect #{})", self.port_name, self.reconnect_count);
                events.push(TickEvent::Reconnected { count: self.reconnect_count });
                TickResult { connected: true, events }
            }
            Err(_) => TickResult { connected: false, events },
        }
    }

    /// Gracefully close the handle.
    pub fn disconnect(&mut self, serial: &mut dyn SerialPort) {
        if serial.is_open() {
            serial.close();
        }
        self.state = ConnectionState::Disconnected;
        info!("disconnected from {}", self.port_name);
    }
}

#[cfg(test)]
#[path = "reconnect_tests.rs"]
mod tests;
