// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thin operator subcommands over the filesystem protocol.
//!
//! Each of these is a few lines over the core modules so the protocol is
//! drivable without external tooling; the daemon never calls them.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use crate::command_queue::append_command;
use crate::config::Config;
use crate::ports;
use crate::registry;
use crate::singleton::{check_singleton, kill_existing_daemon};

/// `eab list-ports`
pub fn list_ports() -> i32 {
    let ports = ports::serial::list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return 0;
    }
    println!("Available serial ports:");
    for port in ports {
        println!("  {}", port.device);
        if !port.description.is_empty() {
            println!("    Description: {}", port.description);
        }
        if !port.hwid.is_empty() {
            println!("    HWID: {}", port.hwid);
        }
    }
    0
}

/// `eab status`
pub fn show_status(config: &Config) -> i32 {
    match check_singleton(&config.session_dir(), &config.device) {
        Some(existing) => {
            println!("EAB Daemon Status:");
            println!("  Running: {}", existing.is_alive);
            println!("  PID: {}", existing.pid);
            println!("  Port: {}", existing.port);
            println!("  Base dir: {}", existing.base_dir);
            println!("  Started: {}", existing.started);
            0
        }
        None => {
            println!("No EAB daemon is running for device '{}'", config.device);
            0
        }
    }
}

/// `eab stop`
pub async fn stop_daemon(config: &Config) -> i32 {
    let session_dir = config.session_dir();
    match check_singleton(&session_dir, &config.device) {
        Some(existing) if existing.is_alive => {
            println!("Stopping EAB daemon (PID {})...", existing.pid);
            if kill_existing_daemon(&session_dir, Duration::from_secs(5)).await {
                println!("Daemon stopped");
                0
            } else {
                eprintln!("Failed to stop daemon");
                1
            }
        }
        _ => {
            println!("No EAB daemon is running for device '{}'", config.device);
            0
        }
    }
}

/// `eab pause --seconds N`
pub fn pause_daemon(config: &Config, seconds: u64) -> anyhow::Result<i32> {
    let session_dir = config.session_dir();
    let running = check_singleton(&session_dir, &config.device)
        .map(|existing| existing.is_alive)
        .unwrap_or(false);
    if !running {
        eprintln!("No EAB daemon is running for device '{}'", config.device);
        return Ok(1);
    }

    let deadline = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs_f64()
        + seconds as f64;
    let pause_path = session_dir.join("pause.txt");
    std::fs::write(&pause_path, format!("{deadline}"))
        .with_context(|| format!("could not write {}", pause_path.display()))?;

    println!("Pausing EAB daemon for {seconds} seconds...");
    println!("Daemon will auto-resume when the pause expires.");
    println!("To resume early: rm {}", pause_path.display());
    Ok(0)
}

/// `eab cmd <command>` / `eab reset`
pub fn send_command(config: &Config, command: &str) -> anyhow::Result<i32> {
    let session_dir = config.session_dir();
    let running = check_singleton(&session_dir, &config.device)
        .map(|existing| existing.is_alive)
        .unwrap_or(false);
    if !running {
        eprintln!("No EAB daemon is running for device '{}'", config.device);
        return Ok(1);
    }

    append_command(&session_dir.join("cmd.txt"), command)?;
    println!("Command sent: {command}");
    Ok(0)
}

/// `eab devices`
pub fn list_devices(config: &Config) -> i32 {
    let devices = registry::list_devices(&config.devices_root());
    if devices.is_empty() {
        println!("No devices registered");
        return 0;
    }
    for device in devices {
        let liveness = if device.is_alive {
            format!("running (PID {})", device.pid)
        } else if device.pid == 0 {
            "registered".to_owned()
        } else {
            "stopped".to_owned()
        };
        println!(
            "{:<20} {:<8} {:<14} {} {}",
            device.device_name, device.device_type, device.chip, liveness, device.port
        );
    }
    0
}

/// `eab register <name>`
pub fn register(config: &Config, name: &str, device_type: &str, chip: &str) -> anyhow::Result<i32> {
    let dir = registry::register_device(&config.devices_root(), name, device_type, chip)?;
    println!("Registered device '{name}' at {}", dir.display());
    Ok(0)
}

/// `eab unregister <name>`
pub fn unregister(config: &Config, name: &str) -> i32 {
    if registry::unregister_device(&config.devices_root(), name) {
        println!("Unregistered device '{name}'");
        0
    } else {
        eprintln!("Could not unregister '{name}' (unknown device, or its daemon is running)");
        1
    }
}

/// Wait for a pattern to appear in the session log, tailing from EOF.
pub async fn wait_for_pattern(
    config: &Config,
    pattern: &str,
    timeout: Duration,
) -> anyhow::Result<i32> {
    let log_path = config.session_dir().join("latest.log");
    let pattern = regex::Regex::new(pattern)?;

    let mut offset = std::fs::metadata(&log_path).map(|m| m.len()).unwrap_or(0);
    let deadline = tokio::time::Instant::now() + timeout;

    println!("Waiting for pattern '{pattern}' (timeout: {}s)...", timeout.as_secs());
    loop {
        if tokio::time::Instant::now() > deadline {
            eprintln!("Timeout waiting for pattern '{pattern}'");
            return Ok(1);
        }
        if let Some(line) = scan_from(&log_path, &mut offset, &pattern) {
            println!("MATCH: {line}");
            return Ok(0);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn scan_from(path: &Path, offset: &mut u64, pattern: &regex::Regex) -> Option<String> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = std::fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    if len < *offset {
        // Rotated out from under us; start over.
        *offset = 0;
    }
    file.seek(SeekFrom::Start(*offset)).ok()?;
    let mut fresh = String::new();
    file.read_to_string(&mut fresh).ok()?;
    *offset += fresh.len() as u64;

    fresh.lines().find(|line| pattern.is_match(line)).map(str::to_owned)
}
