// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auto fault analysis.
//!
//! Crash detection in the daemon loop hands the trigger line to a single
//! background worker over a bounded channel. The worker starts a debug
//! probe's GDB server, reads fault state, decodes it, and emits a
//! `fault_report` event. The worker never touches the serial handle or
//! any daemon state; the event emitter is the only shared object and it
//! serializes appends itself.

pub mod decoder;
pub mod probe;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventEmitter, EventLevel};
use crate::ports::Clock;

use self::decoder::{decoder_for_chip, FaultReport};
use self::probe::{DebugProbe, JLinkProbe, OpenOcdProbe, Xds110Probe};

/// Which probe family the analyzer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    JLink,
    OpenOcd,
    Xds110,
}

impl ProbeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JLink => "jlink",
            Self::OpenOcd => "openocd",
            Self::Xds110 => "xds110",
        }
    }
}

impl std::str::FromStr for ProbeType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jlink" => Ok(Self::JLink),
            "openocd" => Ok(Self::OpenOcd),
            "xds110" => Ok(Self::Xds110),
            other => anyhow::bail!("unknown probe type: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoFaultConfig {
    pub enabled: bool,
    pub chip: String,
    pub device: String,
    pub probe_type: ProbeType,
    pub probe_selector: Option<String>,
    pub elf: Option<PathBuf>,
    pub debounce: Duration,
    pub session_dir: PathBuf,
}

impl Default for AutoFaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chip: "nrf5340".to_owned(),
            device: "NRF5340_XXAA_APP".to_owned(),
            probe_type: ProbeType::JLink,
            probe_selector: None,
            elf: None,
            debounce: Duration::from_secs(5),
            session_dir: PathBuf::from("/tmp/eab-devices/default"),
        }
    }
}

pub type ProbeFactory = Box<dyn Fn() -> Box<dyn DebugProbe> + Send + Sync>;

/// Handle held by the daemon loop. `trigger` is cheap and never blocks:
/// it debounces, checks the busy flag, and enqueues at most one line.
pub struct AutoFaultAnalyzer {
    config: AutoFaultConfig,
    clock: Arc<dyn Clock>,
    tx: tokio::sync::mpsc::Sender<String>,
    last_trigger: Mutex<Option<f64>>,
    busy: Arc<AtomicBool>,
}

impl AutoFaultAnalyzer {
    /// Spawn the worker task and return the trigger handle.
    pub fn spawn(
        config: AutoFaultConfig,
        clock: Arc<dyn Clock>,
        emitter: Arc<EventEmitter>,
        shutdown: CancellationToken,
    ) -> Self {
        Self::spawn_with_probe_factory(config, clock, emitter, shutdown, None)
    }

    /// Variant for tests: inject the probe construction.
    pub fn spawn_with_probe_factory(
        config: AutoFaultConfig,
        clock: Arc<dyn Clock>,
        emitter: Arc<EventEmitter>,
        shutdown: CancellationToken,
        probe_factory: Option<ProbeFactory>,
    ) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(1);
        let busy = Arc::new(AtomicBool::new(false));

        let worker_busy = Arc::clone(&busy);
        let worker_config = config.clone();
        let worker_clock = Arc::clone(&clock);
        tokio::spawn(async move {
            loop {
                let trigger_line = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    line = rx.recv() => match line {
                        Some(line) => line,
                        None => break,
                    },
                };

                worker_busy.store(true, Ordering::SeqCst);
                let started = worker_clock.timestamp();

                let config = worker_config.clone();
                let probe = probe_factory.as_ref().map(|factory| factory());
                let result = tokio::task::spawn_blocking(move || analyze(&config, probe)).await;

                let duration_s =
                    ((worker_clock.timestamp() - started) * 100.0).round() / 100.0;
                let data = match result {
                    Ok(Ok(report)) => report_payload(&worker_config, &trigger_line, &report, duration_s),
                    Ok(Err(e)) => error_payload(&worker_config, &trigger_line, &e.to_string(), duration_s),
                    Err(e) => error_payload(&worker_config, &trigger_line, &e.to_string(), duration_s),
                };
                emitter.emit("fault_report", EventLevel::Error, data);
                info!("fault analysis finished in {duration_s}s");

                worker_busy.store(false, Ordering::SeqCst);
            }
        });

        Self { config, clock, tx, last_trigger: Mutex::new(None), busy }
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Entry point wired to crash detection. Returns true when an
    /// analysis was scheduled.
    pub fn trigger(&self, trigger_line: &str) -> bool {
        if !self.config.enabled {
            return false;
        }

        let now = self.clock.timestamp();
        {
            let mut last = self.last_trigger.lock();
            if let Some(at) = *last {
                if now - at < self.config.debounce.as_secs_f64() {
                    debug!("auto-fault: debouncing crash signal ({:.1}s since last)", now - at);
                    return false;
                }
            }
            if self.is_running() {
                warn!("auto-fault: analysis already in progress, dropping crash signal");
                return false;
            }
            *last = Some(now);
        }

        let truncated: String = trigger_line.chars().take(200).collect();
        match self.tx.try_send(truncated) {
            Ok(()) => {
                info!("auto-fault: scheduled analysis (trigger: {:.80})", trigger_line);
                true
            }
            Err(_) => {
                warn!("auto-fault: worker queue full, dropping crash signal");
                false
            }
        }
    }
}

/// Build the configured probe.
fn build_probe(config: &AutoFaultConfig) -> Box<dyn DebugProbe> {
    match config.probe_type {
        ProbeType::JLink => {
            Box::new(JLinkProbe::new(&config.session_dir, config.probe_selector.as_deref()))
        }
        ProbeType::OpenOcd => Box::new(OpenOcdProbe::new(
            &config.session_dir,
            "interface/cmsis-dap.cfg",
            None,
            Some("swd"),
        )),
        ProbeType::Xds110 => Box::new(Xds110Probe::new(&config.session_dir)),
    }
}

/// The blocking analysis pipeline: probe up, GDB batch, decode, probe
/// down. Probe teardown runs even when the batch fails.
fn analyze(
    config: &AutoFaultConfig,
    probe_override: Option<Box<dyn DebugProbe>>,
) -> anyhow::Result<FaultReport> {
    let decoder = decoder_for_chip(&config.chip)?;
    let mut probe = probe_override.unwrap_or_else(|| build_probe(config));

    probe.start_gdb_server(&config.device)?;

    let batch = probe.run_gdb_batch(&decoder.gdb_commands(), config.elf.as_deref());
    probe.stop_gdb_server();
    let output = batch?;

    Ok(decoder.parse_and_decode(&output))
}

/// Trailing lines of the probe-side RTT capture, when one exists.
fn rtt_context(session_dir: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(session_dir.join("rtt-raw.log")).ok()?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(20);
    Some(lines[start..].join("\n"))
}

fn report_payload(
    config: &AutoFaultConfig,
    trigger_line: &str,
    report: &FaultReport,
    duration_s: f64,
) -> serde_json::Value {
    let fault_registers: serde_json::Map<String, serde_json::Value> = report
        .fault_registers
        .iter()
        .map(|(name, value)| (name.clone(), json!(format!("0x{value:08X}"))))
        .collect();
    let core_regs: serde_json::Map<String, serde_json::Value> = report
        .core_regs
        .iter()
        .map(|(name, value)| (name.clone(), json!(format!("0x{value:08X}"))))
        .collect();

    json!({
        "trigger_line": trigger_line,
        "chip": config.chip,
        "device": config.device,
        "probe_type": config.probe_type.as_str(),
        "arch": report.arch,
        "fault_registers": fault_registers,
        "stacked_pc": report.stacked_pc.map(|pc| format!("0x{pc:08X}")),
        "faults": report.faults,
        "suggestions": report.suggestions,
        "core_regs": core_regs,
        "backtrace": report.backtrace,
        "rtt_context": rtt_context(&config.session_dir),
        "analysis_duration_s": duration_s,
        "error": serde_json::Value::Null,
    })
}

fn error_payload(
    config: &AutoFaultConfig,
    trigger_line: &str,
    error: &str,
    duration_s: f64,
) -> serde_json::Value {
    json!({
        "trigger_line": trigger_line,
        "chip": config.chip,
        "device": config.device,
        "probe_type": config.probe_type.as_str(),
        "analysis_duration_s": duration_s,
        "error": error,
    })
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
