// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Main loop: read, log, match, emit; drain commands; tick status and
//! recovery; honor the pause protocol. No error escapes a tick.

use std::time::Duration;

use serde_json::json;
use tracing::{error, info, warn};

use crate::command_queue::drain_commands;
use crate::device_control::{DeviceController, PortHandling};
use crate::events::EventLevel;
use crate::port_lock::{self, PortLock};
use crate::recovery::RecoveryEvent;
use crate::reconnect::TickEvent;
use crate::status::ConnectionState;
use crate::stream::{looks_like_base64_payload, DataStreamWriter, StreamConfig};

use super::{resolve_auto_port, PauseAction, SerialDaemon};

/// Status refresh cadence; also drives recovery and stream reload.
const STATUS_INTERVAL_S: f64 = 1.0;
/// Grace before a resume so the previous port owner can let go.
const RESUME_GRACE: Duration = Duration::from_millis(500);

impl SerialDaemon {
    /// Run to completion (shutdown token or fatal startup failure).
    pub async fn run(mut self) -> anyhow::Result<()> {
        let shutdown = self.shutdown.clone();
        if !self.reconnect.connect(&mut *self.serial, &shutdown).await {
            if self.shutdown.is_cancelled() {
                self.shutdown_sequence().await;
                return Ok(());
            }
            self.shutdown_sequence().await;
            anyhow::bail!("failed to connect to serial port");
        }

        self.begin_session();

        let mut last_status_update = 0.0f64;
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            // Pause protocol first: while paused the port belongs to
            // someone else and nothing below may run.
            match self.pause.check(self.clock.timestamp()) {
                PauseAction::Run => {}
                PauseAction::Enter { deadline, sleep } => {
                    self.enter_pause(deadline);
                    tokio::time::sleep(sleep).await;
                    continue;
                }
                PauseAction::Hold { sleep } => {
                    tokio::time::sleep(sleep).await;
                    continue;
                }
                PauseAction::Resume { paused_for } => {
                    self.resume_from_pause(paused_for).await;
                }
            }

            let tick = self.reconnect.check_and_reconnect(&mut *self.serial);
            for event in &tick.events {
                self.handle_connection_event(event);
            }
            if !tick.connected {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            if let Some(chunk_size) = self.raw_capture_chunk() {
                // Pure binary capture: divert bytes without line framing.
                let chunk = self.serial.read_bytes(chunk_size);
                if !chunk.is_empty() {
                    self.status.record_bytes(chunk.len() as u64);
                    self.status.record_activity(chunk.len() as u64);
                    if let Some(ref mut writer) = self.stream.writer {
                        if let Err(e) = writer.append(&chunk) {
                            warn!("could not append to data.bin: {e}");
                        }
                    }
                }
            } else if let Some(raw) = self.serial.read_line() {
                self.process_raw_line(&raw);
            }

            self.drain_and_dispatch().await;

            let now = self.clock.timestamp();
            if now - last_status_update >= STATUS_INTERVAL_S {
                last_status_update = now;
                self.status_tick().await;
            }

            if self.serial.bytes_available() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        self.shutdown_sequence().await;
        Ok(())
    }

    fn begin_session(&mut self) {
        let port = self.reconnect.port_name().to_owned();
        let baud = self.config.baud;

        if let Err(e) = self.session_log.start_session(&port, baud) {
            error!("could not start session log: {e}");
        }
        let session_id = self.session_log.session_id().to_owned();
        self.emitter.set_session_id(&session_id);
        self.matcher.reset_counts();

        self.status.start_session(&session_id, &port, baud);
        self.status.set_cold_start(false);
        self.status.set_connection_state(ConnectionState::Connected);

        // Stale commands from before this session are dropped.
        if let Err(e) = drain_commands(&self.cmd_path) {
            warn!("could not clear command file: {e}");
        }

        self.reload_stream_config(true);

        self.emitter
            .info("daemon_started", json!({ "port": port, "baud": baud }));
        info!("daemon started; command file: {}", self.cmd_path.display());
    }

    fn handle_connection_event(&mut self, event: &TickEvent) {
        match event {
            TickEvent::UsbDisconnected => {
                self.status.set_connection_state(ConnectionState::Reconnecting);
                self.status.record_usb_disconnect();
                self.emitter.emit(
                    "usb_disconnect",
                    EventLevel::Warn,
                    json!({ "port": self.reconnect.port_name() }),
                );
            }
            TickEvent::ConnectionLost => {
                self.status.set_connection_state(ConnectionState::Reconnecting);
            }
            TickEvent::Reconnected { count } => {
                self.status.record_reconnect();
                self.status.set_connection_state(ConnectionState::Connected);
                self.emitter.info(
                    "reconnect",
                    json!({ "port": self.reconnect.port_name(), "count": count }),
                );
            }
        }
    }

    /// One received line: sanitize, capture, log, classify, match.
    fn process_raw_line(&mut self, raw: &[u8]) {
        let text = self.sanitizer.sanitize_bytes(raw);
        if text.trim().is_empty() {
            return;
        }

        let byte_count = raw.len() as u64;
        self.status.record_bytes(byte_count);
        self.status.record_activity(byte_count);

        if self.stream_capture(&text, raw) {
            // Opaque payload: counted, captured, nothing else.
            return;
        }

        self.session_log.log_line(&text);
        self.status.record_line();

        if let Some(reset) = self.resets.check_line(&text) {
            if self.resets.is_unexpected_reset(&reset.reason) {
                self.emitter.emit(
                    "unexpected_reset",
                    EventLevel::Warn,
                    json!({ "reason": reset.reason, "raw_line": reset.raw_line }),
                );
            }
        }

        for event in self.recovery.process_line(&text) {
            self.handle_recovery_event(event);
        }

        for alert in self.matcher.check_line(&text) {
            self.alerts.log_alert(&alert);
            self.status.record_alert(&alert.pattern);
            self.emitter.info(
                "alert",
                json!({ "pattern": alert.pattern, "line": alert.line }),
            );
        }
    }

    fn handle_recovery_event(&mut self, event: RecoveryEvent) {
        match event {
            RecoveryEvent::StateChanged { prev, next } => {
                info!("chip state: {prev} -> {next}");
                self.session_log.log_line(&format!("[EAB] Chip state: {next}"));
                self.emitter.info(
                    "chip_state",
                    json!({ "prev": prev.as_str(), "next": next.as_str() }),
                );
            }
            RecoveryEvent::CrashDetected { trigger_line } => {
                error!("crash detected!");
                let head: String = trigger_line.chars().take(100).collect();
                self.session_log.log_line(&format!("[EAB] CRASH DETECTED: {head}"));
                self.analyzer.trigger(&trigger_line);
            }
        }
    }

    /// When the stream is active with pattern matching off, capture is
    /// byte-oriented: return the chunk size to divert with.
    fn raw_capture_chunk(&self) -> Option<usize> {
        let config = self.stream.config.as_ref()?;
        (self.stream.active && config.enabled && !config.pattern_matching)
            .then_some(config.chunk_size.max(1))
    }

    /// Capture a line in binary-stream mode. Returns true when the line
    /// was opaque payload and must skip normal processing.
    fn stream_capture(&mut self, text: &str, raw: &[u8]) -> bool {
        let Some(config) = self.stream.config.clone() else {
            return false;
        };
        if !config.enabled {
            return false;
        }

        if !self.stream.active {
            match config.marker.as_deref() {
                Some(marker) if text.contains(marker) => self.activate_stream(&config),
                Some(_) => return false,
                // No marker: activation happened at config load.
                None => return false,
            }
            // The marker line itself is processed normally.
            return false;
        }

        if let Some(ref mut writer) = self.stream.writer {
            if let Err(e) = writer.append(raw) {
                warn!("could not append to data.bin: {e}");
            }
        }

        // Only clearly-base64 payload is suppressed, so plain firmware
        // text inside a stream still alerts. (With pattern matching
        // disabled entirely, capture is byte-oriented and never reaches
        // this path.)
        looks_like_base64_payload(text)
    }

    fn activate_stream(&mut self, config: &StreamConfig) {
        if self.stream.writer.is_none() {
            match DataStreamWriter::new(&self.session_dir) {
                Ok(writer) => self.stream.writer = Some(writer),
                Err(e) => {
                    warn!("could not open data.bin: {e}");
                    return;
                }
            }
        }
        self.stream.active = true;
        let offset = self.stream.writer.as_ref().map(|w| w.current_offset()).unwrap_or(0);
        self.emitter.info("stream_started", json!({ "offset": offset }));
        self.status.set_stream_state(config.to_section(true));
    }

    fn deactivate_stream(&mut self) {
        if !self.stream.active {
            return;
        }
        self.stream.active = false;
        let offset = self.stream.writer.as_ref().map(|w| w.current_offset()).unwrap_or(0);
        self.emitter.info("stream_stopped", json!({ "offset": offset }));
    }

    /// Reload `stream.json` when its mtime changes (checked at the
    /// status cadence, or forced at session start).
    fn reload_stream_config(&mut self, force: bool) {
        let path = self.session_dir.join("stream.json");
        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if !force && mtime == self.stream.mtime {
            return;
        }
        self.stream.mtime = mtime;

        let config = StreamConfig::load(&self.session_dir);
        match config {
            Some(config) if config.enabled => {
                let section = config.to_section(self.stream.active);
                let start_now = config.marker.is_none();
                self.stream.config = Some(config.clone());
                self.status.set_stream_state(section);
                if start_now && !self.stream.active {
                    self.activate_stream(&config);
                }
            }
            _ => {
                self.deactivate_stream();
                self.stream.config = None;
                self.status.set_stream_state(crate::status::StreamSection::default());
            }
        }
    }

    async fn drain_and_dispatch(&mut self) {
        let commands = match drain_commands(&self.cmd_path) {
            Ok(commands) => commands,
            Err(e) => {
                warn!("could not drain command file: {e}");
                return;
            }
        };

        for command in commands {
            self.dispatch_command(&command).await;
        }
    }

    async fn dispatch_command(&mut self, command: &str) {
        info!("sending command: {command}");
        self.session_log.log_command(command);
        self.status.record_command();
        self.emitter.info("command_sent", json!({ "command": command }));

        if DeviceController::is_special_command(command) {
            // Tool commands cycle the port; surface that in status.
            let cycles_port = ["!FLASH", "!ERASE", "!CHIP_INFO"]
                .iter()
                .any(|prefix| command.to_uppercase().starts_with(prefix));
            if cycles_port {
                self.status.set_connection_state(ConnectionState::Disconnected);
            }

            let result = self
                .controller
                .handle_command(command, &mut *self.serial)
                .await;
            let Some(result) = result else {
                return;
            };

            if result.port_handling == PortHandling::CycledForTool || cycles_port {
                let state = if self.serial.is_open() {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Reconnecting
                };
                self.status.set_connection_state(state);
            }

            info!("special command result: {}", result.message);
            self.session_log.log_line(&format!("[EAB] {}", result.message));
            return;
        }

        let mut data = command.as_bytes().to_vec();
        data.push(b'\n');
        if let Err(e) = self.serial.write(&data) {
            warn!("could not write command to port: {e}");
            self.status.record_io_error();
        }
    }

    async fn status_tick(&mut self) {
        self.status.set_reset_statistics(self.resets.statistics());
        self.reload_stream_config(false);

        for event in self.recovery.tick() {
            self.handle_recovery_event(event);
        }

        if !self.config.no_auto_recovery && self.recovery.needs_recovery() {
            warn!("chip needs recovery, performing automatic reset...");
            let result = self.controller.reset(&mut *self.serial, "hard_reset").await;
            let (attempt, events) = self.recovery.record_recovery_attempt();
            self.emitter.emit(
                "recovery_attempt",
                EventLevel::Warn,
                json!({
                    "attempt": attempt,
                    "max": self.recovery.max_recovery_attempts(),
                    "reset_ok": result.success,
                }),
            );
            for event in events {
                self.handle_recovery_event(event);
            }
        }

        self.status.update();
    }

    fn enter_pause(&mut self, deadline: f64) {
        let port = self.reconnect.port_name().to_owned();
        let remaining = (deadline - self.clock.timestamp()).max(0.0) as u64;
        info!("PAUSING for {remaining}s - releasing serial port for flashing...");

        self.pause.mark_entered(&port);
        self.reconnect.disconnect(&mut *self.serial);
        if let Some(mut lock) = self.port_lock.take() {
            lock.release();
        }
        self.status.set_connection_state(ConnectionState::Disconnected);
        self.session_log
            .log_line(&format!("[EAB] PAUSED - port {port} released for flashing"));
        self.emitter.info("pause", json!({ "deadline": deadline }));
    }

    async fn resume_from_pause(&mut self, paused_for: f64) {
        info!("resuming from pause (was paused {:.0}s)...", paused_for);

        // Give the flasher a moment to let go of the device.
        tokio::time::sleep(RESUME_GRACE).await;

        let original = self
            .pause
            .original_port()
            .unwrap_or(self.reconnect.port_name())
            .to_owned();
        let mut port = original.clone();

        if !self.serial.port_exists(&original) {
            warn!("original port {original} no longer exists");
            let auto_detect = self.config.port.eq_ignore_ascii_case("auto");
            match auto_detect.then(|| resolve_auto_port(&*self.serial)).flatten() {
                Some(new_port) => {
                    info!("auto-detected new port: {new_port}");
                    self.reconnect.set_port_name(&new_port);
                    self.controller.set_port_name(&new_port);
                    self.status.set_port(&new_port);
                    port = new_port;
                }
                None => {
                    warn!("no replacement port found, will retry on next loop...");
                    self.status.set_connection_state(ConnectionState::Reconnecting);
                    self.session_log.log_line(
                        "[EAB] RESUME FAILED - port disappeared, waiting for reconnect",
                    );
                    self.pause.mark_resumed();
                    return;
                }
            }
        }

        // External tools can hold the lock briefly after the pause ends.
        let mut lock = match PortLock::new(&self.config.lock_dir(), &port) {
            Ok(lock) => lock,
            Err(e) => {
                error!("could not build port lock: {e}");
                self.pause.mark_resumed();
                return;
            }
        };
        let mut acquired = false;
        for attempt in 1..=self.config.pause_lock_retries {
            if lock.acquire(Duration::ZERO, true).await {
                acquired = true;
                break;
            }
            warn!(
                "port lock retry {attempt}/{} (a flasher may still be releasing)...",
                self.config.pause_lock_retries
            );
            tokio::time::sleep(Duration::from_millis(self.config.pause_lock_delay_ms)).await;
        }
        if acquired {
            self.port_lock = Some(lock);
        } else {
            error!("failed to re-acquire port lock after pause");
            for user in port_lock::find_port_users(&port).await {
                warn!("  port held by PID {}: {}", user.pid, user.name);
            }
            // Reconnection may still work; the lock is advisory.
        }

        let tick = self.reconnect.check_and_reconnect(&mut *self.serial);
        if tick.connected {
            self.status.set_connection_state(ConnectionState::Connected);
            info!("resumed successfully - serial port reconnected");
            self.session_log.log_line(&format!("[EAB] RESUMED - connected to {port}"));
            self.emitter.info("resume", json!({ "port": port, "paused_for": paused_for }));
        } else {
            warn!("resume: reconnection pending, will retry...");
            self.status.set_connection_state(ConnectionState::Reconnecting);
            self.session_log.log_line("[EAB] RESUME - reconnection pending");
        }

        self.pause.mark_resumed();
    }
}
