// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device registry: one session directory per device under the run root.
//!
//! A device may be "registered" without a daemon (debug probes that never
//! open a serial port); its `daemon.info` carries `pid=0` and no
//! `daemon.pid` file exists.

use std::path::{Path, PathBuf};

use crate::singleton::{self, check_singleton, parse_info_file, DaemonInfo};

/// Session directory for a device name under the devices root.
pub fn device_dir(devices_root: &Path, name: &str) -> PathBuf {
    devices_root.join(name)
}

/// Scan the devices root for all registered devices.
pub fn list_devices(devices_root: &Path) -> Vec<DaemonInfo> {
    let Ok(entries) = std::fs::read_dir(devices_root) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();

    let mut devices = Vec::new();
    for name in names {
        let dir = device_dir(devices_root, &name);
        let info_file = dir.join("daemon.info");
        if !info_file.is_file() {
            continue;
        }

        match check_singleton(&dir, &name) {
            Some(existing) => devices.push(existing),
            None => {
                // daemon.info without daemon.pid: debug-only registration.
                let mut info = parse_info_file(&info_file);
                info.device_name = name;
                if info.base_dir.is_empty() {
                    info.base_dir = dir.display().to_string();
                }
                devices.push(info);
            }
        }
    }
    devices
}

/// Create the session directory and a `pid=0` info file for a device that
/// has no daemon attached. Returns the session directory path.
pub fn register_device(
    devices_root: &Path,
    name: &str,
    device_type: &str,
    chip: &str,
) -> anyhow::Result<PathBuf> {
    let dir = device_dir(devices_root, name);
    std::fs::create_dir_all(&dir)?;
    singleton::write_info_file(
        &dir.join("daemon.info"),
        0,
        "",
        &dir.display().to_string(),
        name,
        device_type,
        chip,
    )?;
    Ok(dir)
}

/// Remove a device's session directory.
///
/// Refuses when a daemon is still alive for the device. There is an
/// inherent TOCTOU window between the liveness check and the removal;
/// unregistration is an operator action, not an automated one.
pub fn unregister_device(devices_root: &Path, name: &str) -> bool {
    let dir = device_dir(devices_root, name);
    if !dir.is_dir() {
        return false;
    }

    if let Some(existing) = check_singleton(&dir, name) {
        if existing.is_alive {
            return false;
        }
    }

    std::fs::remove_dir_all(&dir).is_ok()
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
