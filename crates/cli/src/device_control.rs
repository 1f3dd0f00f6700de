// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device control: DTR/RTS reset sequences and the `!` command
//! vocabulary.
//!
//! Reset is local line toggling; flash, chip-info and erase are delegated
//! to `esptool` as a subprocess with explicit timeouts. The daemon owns
//! the serial handle and passes it in per call; around a flash the
//! orchestrator releases and re-acquires the port.

use std::time::Duration;

use tracing::{error, info};

use crate::ports::SerialPort;

const FLASH_TIMEOUT: Duration = Duration::from_secs(120);
const CHIP_INFO_TIMEOUT: Duration = Duration::from_secs(30);
const ERASE_TIMEOUT: Duration = Duration::from_secs(60);

/// One step of a reset sequence: optional DTR/RTS levels plus a delay.
#[derive(Debug, Clone, Copy)]
struct ResetStep {
    dtr: Option<bool>,
    rts: Option<bool>,
    delay: Duration,
}

const HARD_RESET: &[ResetStep] = &[
    ResetStep { dtr: Some(false), rts: Some(true), delay: Duration::from_millis(100) },
    ResetStep { dtr: Some(false), rts: Some(false), delay: Duration::ZERO },
];

/// GPIO0 held low through the reset edge.
const BOOTLOADER: &[ResetStep] = &[
    ResetStep { dtr: Some(false), rts: Some(true), delay: Duration::from_millis(100) },
    ResetStep { dtr: Some(true), rts: Some(false), delay: Duration::from_millis(50) },
    ResetStep { dtr: Some(false), rts: Some(false), delay: Duration::ZERO },
];

const SOFT_RESET: &[ResetStep] = &[
    ResetStep { dtr: None, rts: Some(true), delay: Duration::from_millis(100) },
    ResetStep { dtr: None, rts: Some(false), delay: Duration::ZERO },
];

fn sequence_by_name(name: &str) -> Option<&'static [ResetStep]> {
    match name {
        "hard_reset" => Some(HARD_RESET),
        "bootloader" => Some(BOOTLOADER),
        "soft_reset" => Some(SOFT_RESET),
        _ => None,
    }
}

/// What the orchestrator must do around a command's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortHandling {
    /// Serial handle stays with the daemon.
    Keep,
    /// Handle was closed for an external tool and reopened afterwards.
    CycledForTool,
}

/// Result of a handled `!` command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub message: String,
    pub success: bool,
    pub port_handling: PortHandling,
}

impl CommandResult {
    fn ok(message: impl Into<String>, port_handling: PortHandling) -> Self {
        Self { message: message.into(), success: true, port_handling }
    }

    fn err(message: impl Into<String>, port_handling: PortHandling) -> Self {
        Self { message: message.into(), success: false, port_handling }
    }
}

pub struct DeviceController {
    port_name: String,
    baud: u32,
}

impl DeviceController {
    pub fn new(port_name: &str, baud: u32) -> Self {
        Self { port_name: port_name.to_owned(), baud }
    }

    pub fn set_port_name(&mut self, port_name: &str) {
        self.port_name = port_name.to_owned();
    }

    pub fn is_special_command(cmd: &str) -> bool {
        cmd.starts_with('!')
    }

    /// Dispatch a `!` command. Returns `None` for ordinary commands.
    pub async fn handle_command(
        &self,
        cmd: &str,
        serial: &mut dyn SerialPort,
    ) -> Option<CommandResult> {
        let rest = cmd.strip_prefix('!')?;
        let (action, arg) = match rest.split_once(':') {
            Some((action, arg)) => (action.to_uppercase(), Some(arg)),
            None => (rest.to_uppercase(), None),
        };

        let result = match action.as_str() {
            "RESET" => self.reset(serial, arg.unwrap_or("hard_reset")).await,
            "BOOTLOADER" => self.reset(serial, "bootloader").await,
            "FLASH" => match arg {
                Some(path) if !path.is_empty() => self.flash(serial, path).await,
                _ => CommandResult::err("ERROR: !FLASH requires firmware path", PortHandling::Keep),
            },
            "CHIP_INFO" => self.chip_info(serial).await,
            "ERASE" => self.erase_flash(serial).await,
            other => CommandResult::err(format!("ERROR: Unknown command: {other}"), PortHandling::Keep),
        };
        Some(result)
    }

    /// Toggle DTR/RTS through the named sequence.
    pub async fn reset(&self, serial: &mut dyn SerialPort, sequence_name: &str) -> CommandResult {
        let Some(sequence) = sequence_by_name(sequence_name) else {
            return CommandResult::err(
                format!("ERROR: Unknown reset sequence: {sequence_name}"),
                PortHandling::Keep,
            );
        };

        info!("resetting device ({sequence_name})...");
        for step in sequence {
            if let Some(level) = step.dtr {
                if let Err(e) = serial.set_dtr(level) {
                    error!("reset failed: {e}");
                    return CommandResult::err(format!("ERROR: Reset failed: {e}"), PortHandling::Keep);
                }
            }
            if let Some(level) = step.rts {
                if let Err(e) = serial.set_rts(level) {
                    error!("reset failed: {e}");
                    return CommandResult::err(format!("ERROR: Reset failed: {e}"), PortHandling::Keep);
                }
            }
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
        }

        info!("device reset complete");
        CommandResult::ok("OK: Device reset", PortHandling::Keep)
    }

    /// Flash firmware via esptool. The handle is closed for the tool and
    /// reopened afterwards.
    pub async fn flash(&self, serial: &mut dyn SerialPort, firmware_path: &str) -> CommandResult {
        info!("flashing {firmware_path}...");
        let args = [
            "--port",
            &self.port_name,
            "--baud",
            "460800",
            "write-flash",
            "0x0",
            firmware_path,
        ];
        self.run_tool(serial, &args, FLASH_TIMEOUT, "Flash").await
    }

    pub async fn chip_info(&self, serial: &mut dyn SerialPort) -> CommandResult {
        info!("reading chip info...");
        let args = ["--port", self.port_name.as_str(), "chip-id"];
        self.run_tool(serial, &args, CHIP_INFO_TIMEOUT, "Chip info").await
    }

    pub async fn erase_flash(&self, serial: &mut dyn SerialPort) -> CommandResult {
        info!("erasing flash...");
        let args = ["--port", self.port_name.as_str(), "erase-flash"];
        self.run_tool(serial, &args, ERASE_TIMEOUT, "Erase").await
    }

    /// Close the handle, run esptool with a deadline, reopen the handle.
    async fn run_tool(
        &self,
        serial: &mut dyn SerialPort,
        args: &[&str],
        timeout: Duration,
        verb: &str,
    ) -> CommandResult {
        let was_open = serial.is_open();
        if was_open {
            serial.close();
        }

        info!("running: esptool {}", args.join(" "));
        let output = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("esptool").args(args).output(),
        )
        .await;

        if was_open {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Err(e) = serial.open(&self.port_name, self.baud) {
                error!("could not reopen port after {verb}: {e}");
            }
        }

        let port_handling =
            if was_open { PortHandling::CycledForTool } else { PortHandling::Keep };

        match output {
            Ok(Ok(output)) if output.status.success() => {
                info!("{verb} complete");
                let stdout = String::from_utf8_lossy(&output.stdout);
                let detail = stdout.trim();
                if detail.is_empty() {
                    CommandResult::ok(format!("OK: {verb} complete"), port_handling)
                } else {
                    CommandResult::ok(format!("OK: {detail}"), port_handling)
                }
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let trimmed: String = stderr.chars().take(200).collect();
                error!("{verb} failed: {trimmed}");
                CommandResult::err(format!("ERROR: {verb} failed: {trimmed}"), port_handling)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                error!("esptool not found");
                CommandResult::err(
                    "ERROR: esptool not found. Install with: pip install esptool",
                    port_handling,
                )
            }
            Ok(Err(e)) => {
                error!("{verb} error: {e}");
                CommandResult::err(format!("ERROR: {e}"), port_handling)
            }
            Err(_) => {
                error!("{verb} timeout");
                CommandResult::err(format!("ERROR: {verb} timeout"), port_handling)
            }
        }
    }
}

#[cfg(test)]
#[path = "device_control_tests.rs"]
mod tests;
