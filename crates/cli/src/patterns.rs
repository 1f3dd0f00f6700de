// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Named pattern bank over the serial line stream, plus the alerts file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::ports::Clock;

/// Default patterns for embedded targets (ESP32-leaning but broadly
/// applicable). Order is preserved so match lists are deterministic.
const DEFAULT_PATTERNS: &[(&str, &str)] = &[
    ("ERROR", r"\bE\s*\(\d+\)|error"),
    ("FAIL", r"fail"),
    ("DISCONNECT", r"disconnect"),
    ("TIMEOUT", r"timeout|timed?\s*out"),
    ("CRASH", r"crash|guru\s*meditation|Backtrace:"),
    ("panic", r"panic|abort\(\)|Rebooting\.\.\."),
    ("assert", r"assert\s*failed|ESP_ERROR_CHECK"),
    ("MEMORY", r"heap|out\s*of\s*memory|alloc\s*failed|stack\s*overflow"),
    ("WATCHDOG", r"wdt|watchdog|Task\s+watchdog"),
    ("BOOT", r"rst:0x|boot:0x|flash\s*read\s*err"),
    ("WIFI", r"wifi:.*fail|WIFI_EVENT_STA_DISCONNECTED"),
    ("BLE", r"BLE.*error|GAP.*fail|GATT.*fail"),
];

/// A single pattern hit on a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMatch {
    pub timestamp: DateTime<Utc>,
    pub pattern: String,
    pub line: String,
}

pub struct PatternMatcher {
    clock: Arc<dyn Clock>,
    // Insertion-ordered so check_line output is stable.
    names: Vec<String>,
    patterns: HashMap<String, Regex>,
    counts: HashMap<String, u64>,
}

impl PatternMatcher {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, names: Vec::new(), patterns: HashMap::new(), counts: HashMap::new() }
    }

    /// Matcher preloaded with the default bank.
    pub fn with_defaults(clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let mut matcher = Self::new(clock);
        for (name, pattern) in DEFAULT_PATTERNS {
            matcher.add_regex(name, pattern)?;
        }
        Ok(matcher)
    }

    /// Add a regex pattern. Case-insensitive.
    pub fn add_regex(&mut self, name: &str, pattern: &str) -> anyhow::Result<()> {
        let compiled = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        if !self.patterns.contains_key(name) {
            self.names.push(name.to_owned());
        }
        self.patterns.insert(name.to_owned(), compiled);
        self.counts.insert(name.to_owned(), 0);
        Ok(())
    }

    /// Add a literal pattern (regex-escaped).
    pub fn add_literal(&mut self, name: &str, literal: &str) -> anyhow::Result<()> {
        self.add_regex(name, &regex::escape(literal))
    }

    pub fn remove(&mut self, name: &str) {
        self.patterns.remove(name);
        self.counts.remove(name);
        self.names.retain(|n| n != name);
    }

    pub fn pattern_names(&self) -> Vec<String> {
        self.names.clone()
    }

    /// Check a line against the bank; returns matches in bank order and
    /// bumps the per-pattern counters.
    pub fn check_line(&mut self, line: &str) -> Vec<AlertMatch> {
        let timestamp = self.clock.now();
        let mut matches = Vec::new();
        for name in &self.names {
            let Some(pattern) = self.patterns.get(name) else {
                continue;
            };
            if pattern.is_match(line) {
                *self.counts.entry(name.clone()).or_insert(0) += 1;
                matches.push(AlertMatch {
                    timestamp,
                    pattern: name.clone(),
                    line: line.to_owned(),
                });
            }
        }
        matches
    }

    pub fn counts(&self) -> HashMap<String, u64> {
        self.counts.clone()
    }

    /// Zero every counter; called at session start.
    pub fn reset_counts(&mut self) {
        for count in self.counts.values_mut() {
            *count = 0;
        }
    }
}

/// Append-only alerts file: `[HH:MM:SS.mmm] [PATTERN] line`.
pub struct AlertLog {
    path: PathBuf,
    alert_count: u64,
}

impl AlertLog {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_owned(), alert_count: 0 }
    }

    pub fn alert_count(&self) -> u64 {
        self.alert_count
    }

    pub fn log_alert(&mut self, alert: &AlertMatch) {
        let stamp = alert.timestamp.format("%H:%M:%S%.3f");
        let formatted = format!("[{stamp}] [{}] {}\n", alert.pattern, alert.line);

        use std::io::Write;
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(formatted.as_bytes()));
        match result {
            Ok(()) => self.alert_count += 1,
            Err(e) => warn!("could not append alert: {e}"),
        }
    }
}

#[cfg(test)]
#[path = "patterns_tests.rs"]
mod tests;
