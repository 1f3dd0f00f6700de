// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Debug probe abstraction: anything that can expose a GDB server.
//!
//! Probes manage an external server subprocess (JLinkGDBServer, openocd,
//! or the XDS110 GDB agent) and run batch GDB command scripts against
//! it. Everything here is blocking; the analyzer worker runs probes on a
//! blocking task off the daemon loop.

use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tracing::{info, warn};

use crate::procs::{pid_alive, stop_process_graceful_blocking};

/// Server start is bounded by this liveness window.
const SERVER_START_WINDOW: Duration = Duration::from_secs(5);
/// Whole-batch GDB deadline.
const GDB_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Status of a GDB server launched by a probe.
#[derive(Debug, Clone)]
pub struct GdbServerStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub port: u16,
    pub last_error: Option<String>,
}

/// Object-safe probe contract.
///
/// `run_gdb_batch` has a default implementation over the real GDB
/// client; the mock overrides it with canned output.
pub trait DebugProbe: Send {
    fn start_gdb_server(&mut self, device: &str) -> anyhow::Result<GdbServerStatus>;

    fn stop_gdb_server(&mut self);

    fn gdb_port(&self) -> u16;

    fn name(&self) -> &'static str;

    fn run_gdb_batch(&mut self, commands: &[String], elf: Option<&Path>) -> anyhow::Result<String> {
        run_gdb_batch(self.gdb_port(), commands, elf, GDB_BATCH_TIMEOUT)
    }
}

/// Run the GDB client in batch mode against `localhost:<port>`.
///
/// Binary comes from `EAB_GDB`, defaulting to `arm-none-eabi-gdb`.
pub fn run_gdb_batch(
    port: u16,
    commands: &[String],
    elf: Option<&Path>,
    timeout: Duration,
) -> anyhow::Result<String> {
    let gdb = std::env::var("EAB_GDB").unwrap_or_else(|_| "arm-none-eabi-gdb".to_owned());

    let mut cmd = Command::new(&gdb);
    cmd.arg("-batch").arg("-nx");
    cmd.args(["-ex", "set confirm off"]);
    cmd.args(["-ex", &format!("target extended-remote localhost:{port}")]);
    cmd.args(["-ex", "monitor halt"]);
    for command in commands {
        cmd.args(["-ex", command]);
    }
    if let Some(elf) = elf {
        cmd.arg(elf);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());

    let mut child = cmd.spawn().with_context(|| format!("could not launch {gdb}"))?;
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait()? {
            Some(status) => {
                let output = child.wait_with_output()?;
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !status.success() && stdout.trim().is_empty() {
                    bail!("gdb exited with {status}: {}", tail(&stderr, 400));
                }
                // Batch output interleaves both streams usefully.
                return Ok(format!("{stdout}\n{stderr}"));
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("gdb batch timed out after {timeout:?}");
            }
            None => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

fn tail(text: &str, max: usize) -> String {
    let mut start = text.len().saturating_sub(max);
    while !text.is_char_boundary(start) {
        start -= 1;
    }
    text[start..].to_owned()
}

/// Shared subprocess-server plumbing for the concrete probes.
struct ServerProcess {
    child: Option<std::process::Child>,
    log_path: PathBuf,
}

impl ServerProcess {
    fn new(base_dir: &Path, log_name: &str) -> Self {
        Self { child: None, log_path: base_dir.join(log_name) }
    }

    fn running_pid(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(None) => Some(child.id() as i32),
            _ => {
                self.child = None;
                None
            }
        }
    }

    /// Spawn the server and wait for its TCP port inside the liveness
    /// window. On failure the log tail is included in the error.
    fn start(&mut self, mut cmd: Command, port: u16) -> anyhow::Result<GdbServerStatus> {
        if let Some(pid) = self.running_pid() {
            return Ok(GdbServerStatus { running: true, pid: Some(pid), port, last_error: None });
        }

        if let Some(dir) = self.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = std::fs::File::create(&self.log_path)?;
        let err_log = log.try_clone()?;
        cmd.stdout(Stdio::from(log)).stderr(Stdio::from(err_log)).stdin(Stdio::null());

        let child = cmd.spawn().context("could not launch GDB server")?;
        let pid = child.id() as i32;
        self.child = Some(child);

        let deadline = Instant::now() + SERVER_START_WINDOW;
        loop {
            if TcpStream::connect_timeout(
                &std::net::SocketAddr::from(([127, 0, 0, 1], port)),
                Duration::from_millis(250),
            )
            .is_ok()
            {
                info!("GDB server listening on :{port} (pid {pid})");
                return Ok(GdbServerStatus { running: true, pid: Some(pid), port, last_error: None });
            }
            if self.running_pid().is_none() || Instant::now() >= deadline {
                let log_tail = std::fs::read_to_string(&self.log_path)
                    .map(|s| tail(&s, 400))
                    .unwrap_or_default();
                self.stop();
                bail!("GDB server did not come up on :{port}: {log_tail}");
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id() as i32;
        if pid_alive(pid) {
            stop_process_graceful_blocking(pid, Duration::from_secs(3));
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

// -- J-Link -------------------------------------------------------------------

pub struct JLinkProbe {
    server: ServerProcess,
    port: u16,
    selector: Option<String>,
}

impl JLinkProbe {
    pub fn new(base_dir: &Path, selector: Option<&str>) -> Self {
        Self {
            server: ServerProcess::new(base_dir, "jlink_probe.log"),
            port: 2331,
            selector: selector.map(str::to_owned),
        }
    }
}

impl DebugProbe for JLinkProbe {
    fn start_gdb_server(&mut self, device: &str) -> anyhow::Result<GdbServerStatus> {
        let mut cmd = Command::new("JLinkGDBServer");
        cmd.args(["-device", device, "-if", "SWD", "-speed", "4000"]);
        cmd.args(["-port", &self.port.to_string()]);
        cmd.args(["-singlerun", "-nogui", "-silent"]);
        if let Some(ref selector) = self.selector {
            cmd.args(["-select", &format!("usb={selector}")]);
        }
        self.server.start(cmd, self.port)
    }

    fn stop_gdb_server(&mut self) {
        self.server.stop();
    }

    fn gdb_port(&self) -> u16 {
        self.port
    }

    fn name(&self) -> &'static str {
        "J-Link"
    }
}

// -- OpenOCD ------------------------------------------------------------------

pub struct OpenOcdProbe {
    server: ServerProcess,
    port: u16,
    interface_cfg: String,
    target_cfg: Option<String>,
    transport: Option<String>,
}

impl OpenOcdProbe {
    pub fn new(
        base_dir: &Path,
        interface_cfg: &str,
        target_cfg: Option<&str>,
        transport: Option<&str>,
    ) -> Self {
        Self {
            server: ServerProcess::new(base_dir, "openocd_probe.log"),
            port: 3333,
            interface_cfg: interface_cfg.to_owned(),
            target_cfg: target_cfg.map(str::to_owned),
            transport: transport.map(str::to_owned),
        }
    }
}

impl DebugProbe for OpenOcdProbe {
    fn start_gdb_server(&mut self, _device: &str) -> anyhow::Result<GdbServerStatus> {
        let mut cmd = Command::new("openocd");
        cmd.args(["-f", &self.interface_cfg]);
        if let Some(ref transport) = self.transport {
            cmd.args(["-c", &format!("transport select {transport}")]);
        }
        if let Some(ref target) = self.target_cfg {
            cmd.args(["-f", target]);
        }
        cmd.args(["-c", &format!("gdb_port {}", self.port)]);
        cmd.args(["-c", "init", "-c", "halt"]);
        self.server.start(cmd, self.port)
    }

    fn stop_gdb_server(&mut self) {
        self.server.stop();
    }

    fn gdb_port(&self) -> u16 {
        self.port
    }

    fn name(&self) -> &'static str {
        "OpenOCD"
    }
}

// -- XDS110 (TI) --------------------------------------------------------------

pub struct Xds110Probe {
    server: ServerProcess,
    port: u16,
}

impl Xds110Probe {
    pub fn new(base_dir: &Path) -> Self {
        Self { server: ServerProcess::new(base_dir, "xds110_probe.log"), port: 3333 }
    }
}

impl DebugProbe for Xds110Probe {
    fn start_gdb_server(&mut self, device: &str) -> anyhow::Result<GdbServerStatus> {
        // TI ships an OpenOCD fork with XDS110 support.
        let mut cmd = Command::new("openocd");
        cmd.args(["-f", "interface/xds110.cfg"]);
        cmd.args(["-c", "transport select swd"]);
        if !device.is_empty() {
            cmd.args(["-f", &format!("target/{}.cfg", device.to_lowercase())]);
        }
        cmd.args(["-c", &format!("gdb_port {}", self.port)]);
        cmd.args(["-c", "init", "-c", "halt"]);
        self.server.start(cmd, self.port)
    }

    fn stop_gdb_server(&mut self) {
        self.server.stop();
    }

    fn gdb_port(&self) -> u16 {
        self.port
    }

    fn name(&self) -> &'static str {
        "XDS110"
    }
}

// -- Mock ---------------------------------------------------------------------

/// Canned probe for tests: no subprocesses, scripted batch output.
pub struct MockProbe {
    pub batch_output: String,
    pub fail_start: bool,
    pub started: bool,
    pub stopped: bool,
}

impl MockProbe {
    pub fn new(batch_output: &str) -> Self {
        Self {
            batch_output: batch_output.to_owned(),
            fail_start: false,
            started: false,
            stopped: false,
        }
    }

    pub fn failing() -> Self {
        Self { batch_output: String::new(), fail_start: true, started: false, stopped: false }
    }
}

impl DebugProbe for MockProbe {
    fn start_gdb_server(&mut self, _device: &str) -> anyhow::Result<GdbServerStatus> {
        if self.fail_start {
            warn!("mock probe configured to fail");
            bail!("mock probe failed to start");
        }
        self.started = true;
        Ok(GdbServerStatus { running: true, pid: None, port: self.gdb_port(), last_error: None })
    }

    fn stop_gdb_server(&mut self) {
        self.stopped = true;
    }

    fn gdb_port(&self) -> u16 {
        2331
    }

    fn name(&self) -> &'static str {
        "Mock"
    }

    fn run_gdb_batch(&mut self, _commands: &[String], _elf: Option<&Path>) -> anyhow::Result<String> {
        Ok(self.batch_output.clone())
    }
}
