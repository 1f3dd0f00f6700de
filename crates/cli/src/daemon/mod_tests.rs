// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::ports::{MockSerial, PortInfo};

fn port(device: &str, description: &str, hwid: &str) -> PortInfo {
    PortInfo { device: device.into(), description: description.into(), hwid: hwid.into() }
}

#[test]
fn auto_detect_prefers_native_usb() {
    let mock = MockSerial::new();
    mock.set_available_ports(vec![
        port("/dev/ttyUSB3", "CP2102 USB to UART Bridge", "USB VID:PID=10c4:ea60"),
        port("/dev/cu.usbmodem14201", "ESP32-S3", "USB VID:PID=303a:1001"),
    ]);
    // "usbmodem" outranks "cp210" in the pattern order.
    assert_eq!(resolve_auto_port(&mock).as_deref(), Some("/dev/cu.usbmodem14201"));
}

#[test]
fn auto_detect_skips_bluetooth_and_debug_ports() {
    let mock = MockSerial::new();
    mock.set_available_ports(vec![
        port("/dev/cu.Bluetooth-Incoming-Port", "Bluetooth serial", "usb"),
        port("/dev/cu.debug-console", "USB debug", "usb"),
        port("/dev/ttyACM0", "CH340 serial", "USB VID:PID=1a86:7523"),
    ]);
    assert_eq!(resolve_auto_port(&mock).as_deref(), Some("/dev/ttyACM0"));
}

#[test]
fn auto_detect_finds_nothing_on_empty_bus() {
    let mock = MockSerial::new();
    assert_eq!(resolve_auto_port(&mock), None);
}

#[test]
fn hwid_match_is_enough() {
    let mock = MockSerial::new();
    mock.set_available_ports(vec![port("/dev/ttyS9", "", "FTDI FT232R")]);
    assert_eq!(resolve_auto_port(&mock).as_deref(), Some("/dev/ttyS9"));
}
