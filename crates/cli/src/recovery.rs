// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Chip health state machine over the incoming line stream.
//!
//! States: Unknown, Booting, Running, Crashed, Stuck, BootLooping.
//! The daemon feeds every sanitized line through [`ChipRecovery::process_line`]
//! and calls [`ChipRecovery::tick`] once per status interval; both return
//! events the orchestrator reacts to (session notes, reset scheduling,
//! fault analysis).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::warn;

use crate::ports::Clock;

/// Crash signatures that flip the chip to Crashed.
///
/// This list is maintained by hand; missing vendor signatures are added
/// here rather than guessed from register contents.
const CRASH_SIGNATURES: &[&str] = &[
    r"Guru\s+Meditation\s+Error",
    r"panic'ed",
    r"Kernel\s+panic",
    r"abort\(\)\s+was\s+called",
    r"Backtrace:",
    r"HARD\s*FAULT",
    r"HardFault",
    r">>>\s*ZEPHYR\s+FATAL\s+ERROR",
    r"assert\s+failed",
    r"ASSERTION\s+FAIL",
    r"undefined\s+instruction",
    r"stack\s+smashing\s+detected",
];

/// Boot banners shared with the reset tracker dialects.
const BOOT_BANNERS: &[&str] = &[
    r"\*\*\*\s+Booting\s+(?:Zephyr|nRF Connect SDK)",
    r"(?:ESP-ROM:|rst:0x|configsip:)",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChipState {
    Unknown,
    Booting,
    Running,
    Crashed,
    Stuck,
    BootLooping,
}

impl ChipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Stuck => "stuck",
            Self::BootLooping => "boot_looping",
        }
    }
}

impl std::fmt::Display for ChipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observations surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    StateChanged { prev: ChipState, next: ChipState },
    CrashDetected { trigger_line: String },
}

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Boot banners within the rolling window before BootLooping.
    pub boot_loop_threshold: usize,
    pub boot_loop_window: Duration,
    /// Banner-free lines after which Booting settles into Running.
    pub settle_lines: u32,
    /// Or a quiet period after the last banner with at least one line.
    pub settle_time: Duration,
    /// No output for this long means Stuck.
    pub stuck_timeout: Duration,
    /// Wait after a crash before the reset is issued.
    pub crash_recovery_delay: Duration,
    /// Resets attempted before giving up and leaving the chip Crashed.
    pub max_recovery_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            boot_loop_threshold: 5,
            boot_loop_window: Duration::from_secs(60),
            settle_lines: 20,
            settle_time: Duration::from_secs(10),
            stuck_timeout: Duration::from_secs(120),
            crash_recovery_delay: Duration::from_secs(2),
            max_recovery_attempts: 3,
        }
    }
}

pub struct ChipRecovery {
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
    crash_patterns: Vec<Regex>,
    boot_patterns: Vec<Regex>,

    state: ChipState,
    last_line_time: Option<DateTime<Utc>>,
    last_banner_time: Option<DateTime<Utc>>,
    banner_times: VecDeque<DateTime<Utc>>,
    lines_since_boot: u32,
    fault_time: Option<DateTime<Utc>>,
    recovery_attempts: u32,
}

impl ChipRecovery {
    pub fn new(clock: Arc<dyn Clock>, config: RecoveryConfig) -> anyhow::Result<Self> {
        let compile = |patterns: &[&str]| -> anyhow::Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Ok(RegexBuilder::new(p).case_insensitive(true).build()?))
                .collect()
        };
        Ok(Self {
            clock,
            config,
            crash_patterns: compile(CRASH_SIGNATURES)?,
            boot_patterns: compile(BOOT_BANNERS)?,
            state: ChipState::Unknown,
            last_line_time: None,
            last_banner_time: None,
            banner_times: VecDeque::new(),
            lines_since_boot: 0,
            fault_time: None,
            recovery_attempts: 0,
        })
    }

    pub fn state(&self) -> ChipState {
        self.state
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }

    pub fn max_recovery_attempts(&self) -> u32 {
        self.config.max_recovery_attempts
    }

    /// Feed one sanitized line through the state machine.
    pub fn process_line(&mut self, line: &str) -> Vec<RecoveryEvent> {
        let now = self.clock.now();
        self.last_line_time = Some(now);
        let mut events = Vec::new();

        if self.boot_patterns.iter().any(|p| p.is_match(line)) {
            self.observe_boot_banner(now, &mut events);
            return events;
        }

        if self.state != ChipState::Crashed
            && self.crash_patterns.iter().any(|p| p.is_match(line))
        {
            self.fault_time = Some(now);
            self.transition(ChipState::Crashed, &mut events);
            events.push(RecoveryEvent::CrashDetected { trigger_line: line.to_owned() });
            return events;
        }

        match self.state {
            ChipState::Booting | ChipState::BootLooping => {
                self.lines_since_boot += 1;
                let settled_by_lines = self.lines_since_boot >= self.config.settle_lines;
                let settled_by_time = self
                    .last_banner_time
                    .is_some_and(|at| now - at >= chrono_delta(self.config.settle_time));
                if settled_by_lines || settled_by_time {
                    self.recovery_attempts = 0;
                    self.transition(ChipState::Running, &mut events);
                }
            }
            // Output resumed: the chip was never actually wedged.
            ChipState::Stuck => {
                self.transition(ChipState::Running, &mut events);
            }
            ChipState::Unknown | ChipState::Running | ChipState::Crashed => {}
        }

        events
    }

    /// Periodic check (status cadence) for silence-based transitions.
    pub fn tick(&mut self) -> Vec<RecoveryEvent> {
        let mut events = Vec::new();
        if !matches!(self.state, ChipState::Running | ChipState::Booting) {
            return events;
        }
        let Some(last) = self.last_line_time else {
            return events;
        };
        if self.clock.now() - last > chrono_delta(self.config.stuck_timeout) {
            self.fault_time = Some(self.clock.now());
            self.transition(ChipState::Stuck, &mut events);
        }
        events
    }

    /// Whether an automatic reset should be issued now.
    ///
    /// True once the post-fault delay has elapsed in a fault state, until
    /// the attempt cap is hit; then the chip is left as-is for the
    /// operator.
    pub fn needs_recovery(&self) -> bool {
        if !matches!(self.state, ChipState::Crashed | ChipState::Stuck | ChipState::BootLooping) {
            return false;
        }
        if self.recovery_attempts >= self.config.max_recovery_attempts {
            return false;
        }
        match self.fault_time {
            Some(at) => self.clock.now() - at >= chrono_delta(self.config.crash_recovery_delay),
            None => false,
        }
    }

    /// Record that a reset was issued. Returns the attempt number. The
    /// chip is expected to boot, so the state moves to Booting.
    pub fn record_recovery_attempt(&mut self) -> (u32, Vec<RecoveryEvent>) {
        self.recovery_attempts += 1;
        if self.recovery_attempts >= self.config.max_recovery_attempts {
            warn!(
                "recovery attempt {}/{} is the last before giving up",
                self.recovery_attempts, self.config.max_recovery_attempts
            );
        }
        let mut events = Vec::new();
        self.fault_time = None;
        self.lines_since_boot = 0;
        // The reset is the settle baseline when no banner follows.
        self.last_banner_time = Some(self.clock.now());
        self.transition(ChipState::Booting, &mut events);
        (self.recovery_attempts, events)
    }

    /// Called before daemon exit. Returns the reset variant to issue so
    /// the target is left in a known state, when one was ever observed.
    pub fn clean_shutdown(&mut self) -> Option<&'static str> {
        if self.state == ChipState::Unknown {
            None
        } else {
            Some("soft_reset")
        }
    }

    fn observe_boot_banner(&mut self, now: DateTime<Utc>, events: &mut Vec<RecoveryEvent>) {
        self.last_banner_time = Some(now);
        self.lines_since_boot = 0;

        self.banner_times.push_back(now);
        let window = chrono_delta(self.config.boot_loop_window);
        while let Some(&front) = self.banner_times.front() {
            if now - front > window {
                self.banner_times.pop_front();
            } else {
                break;
            }
        }

        if self.banner_times.len() >= self.config.boot_loop_threshold {
            self.fault_time = Some(now);
            self.transition(ChipState::BootLooping, events);
        } else {
            self.transition(ChipState::Booting, events);
        }
    }

    fn transition(&mut self, next: ChipState, events: &mut Vec<RecoveryEvent>) {
        if self.state == next {
            return;
        }
        let prev = self.state;
        self.state = next;
        events.push(RecoveryEvent::StateChanged { prev, next });
    }
}

fn chrono_delta(duration: Duration) -> chrono::TimeDelta {
    chrono::TimeDelta::from_std(duration).unwrap_or_default()
}

#[cfg(test)]
#[path = "recovery_tests.rs"]
mod tests;
