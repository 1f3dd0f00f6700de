// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The serial daemon: wires every component into one cooperative loop.
//!
//! [`SerialDaemon::prepare`] performs the whole startup sequence
//! (singleton, contention checks, port lock, placeholder status) and is
//! shared by `main` and the integration specs — tests hand it a mock
//! serial port and drive it through the filesystem exactly as an agent
//! would.

pub mod pause;
mod run;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::device_control::DeviceController;
use crate::events::EventEmitter;
use crate::fault::AutoFaultAnalyzer;
use crate::patterns::{AlertLog, PatternMatcher};
use crate::port_lock::{self, PortLock};
use crate::ports::{Clock, SerialDevice, SerialPort, SystemClock};
use crate::reconnect::ReconnectionManager;
use crate::recovery::{ChipRecovery, RecoveryConfig};
use crate::reset_reason::ResetReasonTracker;
use crate::sanitize::Sanitizer;
use crate::session_log::SessionLogger;
use crate::singleton::Singleton;
use crate::status::StatusManager;
use crate::stream::{DataStreamWriter, StreamConfig};

pub use self::pause::{PauseAction, PauseGate};

/// USB identifier fragments that look like an ESP dev board, in
/// preference order. Native USB first, then the usual bridge chips.
const ESP_PORT_PATTERNS: &[&str] = &[
    "usbmodem",
    "cp210",
    "silicon_labs",
    "silabs",
    "ch340",
    "ch341",
    "wch",
    "ftdi",
    "ft232",
    "usbserial",
    "usb",
];

/// Pick an ESP-like port from the enumerable devices. Bluetooth and
/// debug-console endpoints are skipped.
pub fn resolve_auto_port(serial: &dyn SerialPort) -> Option<String> {
    let ports = serial.list_ports();
    for pattern in ESP_PORT_PATTERNS {
        for port in &ports {
            let device = port.device.to_lowercase();
            let description = port.description.to_lowercase();
            let hwid = port.hwid.to_lowercase();
            if !(device.contains(pattern)
                || description.contains(pattern)
                || hwid.contains(pattern))
            {
                continue;
            }
            if description.contains("bluetooth") || device.contains("debug-console") {
                continue;
            }
            info!("auto-detected port: {} ({})", port.device, port.description);
            return Some(port.device.clone());
        }
    }
    None
}

/// Binary-capture bookkeeping for the loop.
pub(crate) struct StreamState {
    pub(crate) config: Option<StreamConfig>,
    pub(crate) writer: Option<DataStreamWriter>,
    pub(crate) active: bool,
    pub(crate) mtime: Option<std::time::SystemTime>,
}

impl StreamState {
    fn idle() -> Self {
        Self { config: None, writer: None, active: false, mtime: None }
    }
}

pub struct SerialDaemon {
    pub(crate) config: Config,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) serial: Box<dyn SerialPort>,
    pub(crate) session_dir: PathBuf,
    pub(crate) cmd_path: PathBuf,
    pub(crate) sanitizer: Sanitizer,
    pub(crate) singleton: Singleton,
    pub(crate) port_lock: Option<PortLock>,
    pub(crate) reconnect: ReconnectionManager,
    pub(crate) session_log: SessionLogger,
    pub(crate) matcher: PatternMatcher,
    pub(crate) alerts: AlertLog,
    pub(crate) status: StatusManager,
    pub(crate) emitter: Arc<EventEmitter>,
    pub(crate) resets: ResetReasonTracker,
    pub(crate) recovery: ChipRecovery,
    pub(crate) controller: DeviceController,
    pub(crate) analyzer: AutoFaultAnalyzer,
    pub(crate) pause: PauseGate,
    pub(crate) stream: StreamState,
    pub(crate) shutdown: CancellationToken,
}

impl SerialDaemon {
    /// Full startup sequence up to (but not including) the first
    /// connect. Fails on singleton conflict or an unacquirable port.
    pub async fn prepare(
        config: Config,
        serial: Box<dyn SerialPort>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Self> {
        let session_dir = config.session_dir();
        std::fs::create_dir_all(&session_dir)
            .with_context(|| format!("could not create {}", session_dir.display()))?;

        info!("starting EAB serial daemon for device '{}'", config.device);
        info!("session directory: {}", session_dir.display());

        // Resolve `auto` before anything records the port name.
        let port_name = if config.port.eq_ignore_ascii_case("auto") {
            resolve_auto_port(&*serial)
                .context("no ESP-like serial port found (try --port explicitly)")?
        } else {
            config.port.clone()
        };
        info!("port: {port_name}, baud: {}", config.baud);

        // Singleton first, port lock second; the fixed order rules out
        // lock cycles between daemons.
        let mut singleton = Singleton::new(&session_dir, &config.device);
        let acquired = singleton
            .acquire(
                &port_name,
                &session_dir.display().to_string(),
                "serial",
                &config.chip,
                config.force,
            )
            .await;
        if !acquired {
            bail!("could not acquire daemon singleton for device '{}'", config.device);
        }

        let lock_dir = config.lock_dir();

        // Contention is logged, not fatal: the advisory lock below is
        // the arbiter.
        for user in port_lock::find_port_users(&port_name).await {
            warn!("port {port_name} may be in use by PID {}: {}", user.pid, user.name);
        }
        for owner in port_lock::list_all_locks(&lock_dir) {
            if owner.port == port_name {
                warn!(
                    "port {port_name} locked by EAB PID {} ({}) since {}",
                    owner.pid, owner.process_name, owner.started
                );
            }
        }

        if config.force {
            let signaled =
                port_lock::kill_port_users(&port_name, nix::sys::signal::Signal::SIGTERM).await;
            if !signaled.is_empty() {
                warn!("sent SIGTERM to port users: {signaled:?}");
                tokio::time::sleep(Duration::from_millis(500)).await;
                port_lock::kill_port_users(&port_name, nix::sys::signal::Signal::SIGKILL).await;
            }
            let report = port_lock::cleanup_dead_locks(&lock_dir);
            if report.removed_lock > 0 {
                info!("cleaned up {} dead lock(s)", report.removed_lock);
            }
        }

        if config.clear_session {
            for stale in ["status.json", "alerts.log", "events.jsonl"] {
                let _ = std::fs::remove_file(session_dir.join(stale));
            }
        }

        let mut lock = PortLock::new(&lock_dir, &port_name)?;
        if !lock.acquire(Duration::ZERO, true).await {
            let owner = lock.owner();
            singleton.release();
            match owner {
                Some(o) => bail!(
                    "port {port_name} is locked by PID {} ({})",
                    o.pid,
                    o.process_name
                ),
                None => bail!("could not acquire lock for {port_name}"),
            }
        }

        let emitter = Arc::new(EventEmitter::new(
            Arc::clone(&clock),
            &session_dir.join("events.jsonl"),
        )?);

        let analyzer = AutoFaultAnalyzer::spawn(
            config.auto_fault_config()?,
            Arc::clone(&clock),
            Arc::clone(&emitter),
            shutdown.clone(),
        );

        let mut status = StatusManager::new(Arc::clone(&clock), &session_dir.join("status.json"));
        status.set_cold_start(true);
        status.set_port(&port_name);
        status.update();

        Ok(Self {
            session_log: SessionLogger::new(Arc::clone(&clock), &session_dir, config.rotation())?,
            matcher: PatternMatcher::with_defaults(Arc::clone(&clock))?,
            alerts: AlertLog::new(&session_dir.join("alerts.log")),
            resets: ResetReasonTracker::new(Arc::clone(&clock))?,
            recovery: ChipRecovery::new(Arc::clone(&clock), RecoveryConfig::default())?,
            controller: DeviceController::new(&port_name, config.baud),
            reconnect: ReconnectionManager::new(&port_name, config.baud, config.max_retries),
            pause: PauseGate::new(&session_dir),
            stream: StreamState::idle(),
            cmd_path: session_dir.join("cmd.txt"),
            sanitizer: Sanitizer::new()?,
            singleton,
            port_lock: Some(lock),
            status,
            emitter,
            analyzer,
            session_dir,
            config,
            clock,
            serial,
            shutdown,
        })
    }

    /// Rebuild the fault analyzer around an injected probe factory.
    /// Used by the integration specs to run analyses without hardware.
    pub fn use_probe_factory(&mut self, factory: crate::fault::ProbeFactory) -> anyhow::Result<()> {
        self.analyzer = AutoFaultAnalyzer::spawn_with_probe_factory(
            self.config.auto_fault_config()?,
            Arc::clone(&self.clock),
            Arc::clone(&self.emitter),
            self.shutdown.clone(),
            Some(factory),
        );
        Ok(())
    }

    /// Shutdown sequence: leave the chip clean, close the session, drop
    /// every lock.
    pub(crate) async fn shutdown_sequence(&mut self) {
        info!("stopping daemon...");

        if self.serial.is_open() {
            if let Some(variant) = self.recovery.clean_shutdown() {
                let result = self.controller.reset(&mut *self.serial, variant).await;
                if !result.success {
                    warn!("clean-shutdown reset failed: {}", result.message);
                }
            }
        }

        self.session_log.end_session();
        self.reconnect.disconnect(&mut *self.serial);
        self.status.set_cold_start(false);
        self.status.set_connection_state(crate::status::ConnectionState::Disconnected);
        self.status.update();

        self.emitter.info(
            "daemon_stopped",
            json!({
                "lines_logged": self.session_log.lines_logged(),
                "commands_sent": self.session_log.commands_sent(),
            }),
        );

        if let Some(mut lock) = self.port_lock.take() {
            lock.release();
        }
        self.singleton.release();
        info!("daemon stopped");
    }
}

/// Production entry point: real serial device, system clock, dual-signal
/// handler (second SIGTERM/SIGINT forces exit).
pub async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    {
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
            let mut sigint =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

            tokio::select! {
                _ = async {
                    if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGTERM"),
                _ = async {
                    if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGINT"),
            }
            sd.cancel();

            tokio::select! {
                _ = async {
                    if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGTERM again, forcing exit"),
                _ = async {
                    if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGINT again, forcing exit"),
            }
            std::process::exit(130);
        });
    }

    let serial = Box::new(SerialDevice::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let daemon = SerialDaemon::prepare(config, serial, clock, shutdown.clone()).await?;
    daemon.run().await
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
