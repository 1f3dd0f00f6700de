// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end daemon scenarios.
//!
//! Runs the daemon in-process over a [`MockSerial`] inside a tempdir run
//! root and observes it exactly the way an agent would: by reading the
//! session directory artifacts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser as _;
use tokio_util::sync::CancellationToken;

use eab::config::Config;
use eab::daemon::SerialDaemon;
use eab::events::{read_events, EventRecord};
use eab::fault::ProbeFactory;
use eab::ports::{Clock, MockSerial, PortInfo, SystemClock};

/// Device path the mock serial presents.
pub const MOCK_PORT: &str = "/dev/ttyMOCK0";

const POLL: Duration = Duration::from_millis(20);
const TIMEOUT: Duration = Duration::from_secs(5);

/// A daemon running in-process against a mock serial port.
pub struct DaemonFixture {
    pub mock: MockSerial,
    pub session_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    _run_root: tempfile::TempDir,
}

impl DaemonFixture {
    /// Start a daemon with default spec settings, letting the caller
    /// adjust the parsed [`Config`] first.
    pub async fn start(customize: impl FnOnce(&mut Config)) -> anyhow::Result<Self> {
        Self::start_inner(customize, None).await
    }

    /// Same, with an injected debug-probe factory for fault analysis.
    pub async fn start_with_probe(
        customize: impl FnOnce(&mut Config),
        factory: ProbeFactory,
    ) -> anyhow::Result<Self> {
        Self::start_inner(customize, Some(factory)).await
    }

    async fn start_inner(
        customize: impl FnOnce(&mut Config),
        factory: Option<ProbeFactory>,
    ) -> anyhow::Result<Self> {
        let run_root = tempfile::tempdir()?;

        let mut config = Config::try_parse_from([
            "eab",
            "--port",
            MOCK_PORT,
            "--device",
            "specdev",
            "--run-dir",
            &run_root.path().display().to_string(),
            "--log-level",
            "error",
        ])?;
        customize(&mut config);
        config.validate()?;

        let mock = MockSerial::new();
        mock.set_available_ports(vec![PortInfo {
            device: MOCK_PORT.to_owned(),
            description: "CP2102N USB to UART Bridge".to_owned(),
            hwid: "USB VID:PID=10c4:ea60".to_owned(),
        }]);

        let session_dir = config.session_dir();
        let lock_dir = config.lock_dir();
        let shutdown = CancellationToken::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut daemon =
            SerialDaemon::prepare(config, Box::new(mock.clone()), clock, shutdown.clone()).await?;
        if let Some(factory) = factory {
            daemon.use_probe_factory(factory)?;
        }
        let handle = tokio::spawn(daemon.run());

        let fixture = Self {
            mock,
            session_dir,
            lock_dir,
            shutdown,
            handle,
            _run_root: run_root,
        };

        // The daemon is up once it has published its first session.
        fixture
            .wait_status(|status| status["session"]["id"].as_str().is_some_and(|id| !id.is_empty()))
            .await?;
        Ok(fixture)
    }

    /// Path of the advisory lock file for the mock port.
    pub fn port_lock_path(&self) -> PathBuf {
        self.lock_dir.join("_dev_ttyMOCK0.lock")
    }

    pub fn read_status(&self) -> Option<serde_json::Value> {
        let contents = std::fs::read_to_string(self.session_dir.join("status.json")).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        read_events(&self.session_dir.join("events.jsonl"))
    }

    pub fn session_log(&self) -> String {
        std::fs::read_to_string(self.session_dir.join("latest.log")).unwrap_or_default()
    }

    pub fn alerts_log(&self) -> String {
        std::fs::read_to_string(self.session_dir.join("alerts.log")).unwrap_or_default()
    }

    /// Poll `status.json` until the predicate holds.
    pub async fn wait_status(
        &self,
        predicate: impl Fn(&serde_json::Value) -> bool,
    ) -> anyhow::Result<serde_json::Value> {
        self.wait_status_for(predicate, TIMEOUT).await
    }

    pub async fn wait_status_for(
        &self,
        predicate: impl Fn(&serde_json::Value) -> bool,
        timeout: Duration,
    ) -> anyhow::Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.read_status() {
                if predicate(&status) {
                    return Ok(status);
                }
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("status.json never satisfied predicate: {:?}", self.read_status());
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Poll the event stream until an event of the given type appears.
    pub async fn wait_event(&self, event_type: &str) -> anyhow::Result<EventRecord> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if let Some(record) =
                self.events().into_iter().find(|r| r.event_type == event_type)
            {
                return Ok(record);
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("no {event_type} event appeared");
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Poll the session log until it contains the needle.
    pub async fn wait_log_contains(&self, needle: &str) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if self.session_log().contains(needle) {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("session log never contained {needle:?}");
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Graceful stop: cancel and wait for the run task.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.shutdown.cancel();
        tokio::time::timeout(TIMEOUT, self.handle).await???;
        Ok(())
    }
}

/// Seconds since the Unix epoch, as the pause protocol writes them.
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Queue a command the way an agent would.
pub fn write_command(session_dir: &Path, command: &str) -> anyhow::Result<()> {
    eab::command_queue::append_command(&session_dir.join("cmd.txt"), command)
}
