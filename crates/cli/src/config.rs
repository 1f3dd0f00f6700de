// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

use crate::fault::{AutoFaultConfig, ProbeType};
use crate::session_log::RotationConfig;

/// Serial daemon configuration.
#[derive(Debug, Clone, Parser)]
pub struct Config {
    /// Serial port, or "auto" to detect an ESP-like device.
    #[arg(long, short = 'p', env = "EAB_PORT", default_value = "auto")]
    pub port: String,

    /// Baud rate.
    #[arg(long, short = 'b', env = "EAB_BAUD", default_value = "115200")]
    pub baud: u32,

    /// Device name; its session directory lives under the run root.
    #[arg(long, short = 'd', env = "EAB_DEVICE", default_value = "default")]
    pub device: String,

    /// Run root for session directories and lock files.
    #[arg(long, env = "EAB_RUN_DIR", default_value = "/tmp")]
    pub run_dir: PathBuf,

    /// Chip identifier (registry metadata + fault decoder selection).
    #[arg(long, env = "EAB_CHIP", default_value = "esp32")]
    pub chip: String,

    /// Kill any existing daemon for this device and take over.
    #[arg(long, short = 'f')]
    pub force: bool,

    /// Remove stale session files (status, alerts, events) on startup.
    #[arg(long)]
    pub clear_session: bool,

    /// Disable automatic chip recovery (reset on crash/stuck/boot-loop).
    #[arg(long, env = "EAB_NO_AUTO_RECOVERY")]
    pub no_auto_recovery: bool,

    /// Connection attempts before giving up (0 = retry forever).
    #[arg(long, env = "EAB_MAX_RETRIES", default_value = "0")]
    pub max_retries: u32,

    /// Session log size that triggers rotation.
    #[arg(long, env = "EAB_LOG_MAX_BYTES", default_value = "100000000")]
    pub log_max_bytes: u64,

    /// Rotated session logs to keep.
    #[arg(long, env = "EAB_LOG_MAX_FILES", default_value = "5")]
    pub log_max_files: u32,

    /// Keep rotated logs uncompressed.
    #[arg(long, env = "EAB_LOG_NO_COMPRESS")]
    pub log_no_compress: bool,

    /// Port-lock reacquisition attempts when resuming from a pause
    /// (external flashers can hold the port briefly).
    #[arg(long, env = "EAB_PAUSE_LOCK_RETRIES", default_value = "10")]
    pub pause_lock_retries: u32,

    /// Delay between those attempts, in milliseconds.
    #[arg(long, env = "EAB_PAUSE_LOCK_DELAY_MS", default_value = "500")]
    pub pause_lock_delay_ms: u64,

    /// Run GDB fault analysis automatically on crash detection.
    #[arg(long, env = "EAB_AUTO_FAULT")]
    pub auto_fault: bool,

    /// Debug probe type (jlink, openocd, xds110).
    #[arg(long, env = "EAB_PROBE", default_value = "jlink")]
    pub probe: String,

    /// Probe selector (e.g. a J-Link USB serial).
    #[arg(long, env = "EAB_PROBE_SELECTOR")]
    pub probe_selector: Option<String>,

    /// GDB target device name handed to the probe.
    #[arg(long, env = "EAB_GDB_DEVICE", default_value = "NRF5340_XXAA_APP")]
    pub gdb_device: String,

    /// ELF with symbols for fault backtraces.
    #[arg(long, env = "EAB_ELF")]
    pub elf: Option<PathBuf>,

    /// Log format (json or text).
    #[arg(long, env = "EAB_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "EAB_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.baud == 0 {
            anyhow::bail!("--baud must be non-zero");
        }
        if self.device.is_empty() || self.device.contains(['/', '\\']) {
            anyhow::bail!("--device must be a plain name, not a path");
        }
        if self.log_max_files == 0 {
            anyhow::bail!("--log-max-files must be at least 1");
        }
        self.probe.parse::<ProbeType>()?;
        Ok(())
    }

    /// Root of all per-device session directories.
    pub fn devices_root(&self) -> PathBuf {
        self.run_dir.join("eab-devices")
    }

    /// This device's session directory.
    pub fn session_dir(&self) -> PathBuf {
        self.devices_root().join(&self.device)
    }

    /// Directory holding port lock files.
    pub fn lock_dir(&self) -> PathBuf {
        self.run_dir.join("eab-locks")
    }

    pub fn rotation(&self) -> RotationConfig {
        RotationConfig {
            max_size_bytes: self.log_max_bytes,
            max_files: self.log_max_files,
            compress: !self.log_no_compress,
        }
    }

    pub fn auto_fault_config(&self) -> anyhow::Result<AutoFaultConfig> {
        Ok(AutoFaultConfig {
            enabled: self.auto_fault,
            chip: self.chip.clone(),
            device: self.gdb_device.clone(),
            probe_type: self.probe.parse()?,
            probe_selector: self.probe_selector.clone(),
            elf: self.elf.clone(),
            debounce: std::time::Duration::from_secs(5),
            session_dir: self.session_dir(),
        })
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
