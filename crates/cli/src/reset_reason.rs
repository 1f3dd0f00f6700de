// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reset-reason detection across vendor boot banners.
//!
//! Dialects:
//! - ESP-IDF: `rst:0x1 (POWERON_RESET),boot:0x13 (SPI_FAST_FLASH_BOOT)`
//! - Zephyr nRF: `Reset reason: 0x00000004 (RESETPIN)`
//! - Zephyr STM32: `Reset cause: PIN (RCC_CSR = 0x0C000000)`
//! - Generic: `Reset cause: Power-on reset` / `Boot reason: ...`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};

use crate::ports::Clock;
use crate::status::ResetSection;

/// Reset reasons that indicate the target did not restart on purpose.
const ALERT_REASONS: &[&str] = &[
    // Watchdogs
    "WATCHDOG",
    "WDT",
    "TG0WDT_SYS_RESET",
    "TG1WDT_SYS_RESET",
    "RTCWDT_RTC_RESET",
    "INT_WDT",
    "TASK_WDT",
    // Brownout
    "BROWNOUT",
    "BROWNOUT_RESET",
    // Panic / crash
    "PANIC",
    "SW_CPU_RESET",
    "EXCEPTION",
    "DEEPSLEEP_RESET",
    // Fault resets
    "LOCKUP",
    "SYSRESETREQ",
];

/// A single observed reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetEvent {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub raw_line: String,
}

pub struct ResetReasonTracker {
    clock: Arc<dyn Clock>,
    esp32: Regex,
    zephyr_nrf: Regex,
    zephyr_stm32: Regex,
    generic: Regex,
    zephyr_banner: Regex,
    esp32_banner: Regex,

    history: Vec<ResetEvent>,
    counts: std::collections::HashMap<String, u64>,
    last_reason: Option<String>,
    last_time: Option<DateTime<Utc>>,
}

fn insensitive(pattern: &str) -> anyhow::Result<Regex> {
    Ok(RegexBuilder::new(pattern).case_insensitive(true).build()?)
}

impl ResetReasonTracker {
    pub fn new(clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        Ok(Self {
            clock,
            esp32: insensitive(r"rst:0x[0-9a-fA-F]+\s*\(([^)]+)\)")?,
            zephyr_nrf: insensitive(r"Reset\s+reason:\s*0x[0-9a-fA-F]+\s*\(([^)]+)\)")?,
            zephyr_stm32: insensitive(
                r"Reset\s+cause:\s*([A-Z_]+)(?:\s*\(RCC_CSR\s*=\s*0x[0-9a-fA-F]+\)|\s*$)",
            )?,
            generic: insensitive(r"(?:Reset|Boot)\s+(?:cause|reason):\s*([^(]+?)(?:\s*\(|$)")?,
            zephyr_banner: insensitive(r"\*\*\*\s+Booting\s+(?:Zephyr|nRF Connect SDK)")?,
            esp32_banner: insensitive(r"(?:ESP-ROM:|rst:0x|configsip:)")?,
            history: Vec::new(),
            counts: std::collections::HashMap::new(),
            last_reason: None,
            last_time: None,
        })
    }

    /// Check a line for a reset reason. Dialects are tried most-specific
    /// first; the captured reason is uppercased.
    pub fn check_line(&mut self, line: &str) -> Option<ResetEvent> {
        let reason = [&self.esp32, &self.zephyr_nrf, &self.zephyr_stm32, &self.generic]
            .iter()
            .find_map(|pattern| pattern.captures(line))
            .map(|captures| captures[1].trim().to_uppercase())?;

        let event = ResetEvent {
            timestamp: self.clock.now(),
            reason: reason.clone(),
            raw_line: line.trim().to_owned(),
        };
        self.history.push(event.clone());
        *self.counts.entry(reason.clone()).or_insert(0) += 1;
        self.last_time = Some(event.timestamp);
        self.last_reason = Some(reason);
        Some(event)
    }

    /// Whether a line looks like a boot banner, even without an explicit
    /// reset reason.
    pub fn is_boot_line(&self, line: &str) -> bool {
        self.zephyr_banner.is_match(line) || self.esp32_banner.is_match(line)
    }

    /// Whether this reason should alert (watchdog, brownout, panic, ...).
    /// Substring matches cover decorated forms like `TASK_WDT_RESET_CPU0`.
    pub fn is_unexpected_reset(&self, reason: &str) -> bool {
        let upper = reason.to_uppercase();
        ALERT_REASONS.iter().any(|token| upper.contains(token))
    }

    /// Statistics block for `status.json`.
    pub fn statistics(&self) -> ResetSection {
        ResetSection {
            last_reason: self.last_reason.clone(),
            last_time: self.last_time,
            history: self.counts.clone(),
            total: self.history.len() as u64,
        }
    }

    /// Recent resets, newest first.
    pub fn recent_resets(&self, count: usize) -> Vec<ResetEvent> {
        let skip = self.history.len().saturating_sub(count);
        self.history.iter().skip(skip).rev().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.counts.clear();
        self.last_reason = None;
        self.last_time = None;
    }
}

#[cfg(test)]
#[path = "reset_reason_tests.rs"]
mod tests;
