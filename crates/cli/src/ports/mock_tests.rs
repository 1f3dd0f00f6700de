// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn open(mock: &MockSerial) -> MockSerial {
    let mut handle = mock.clone();
    handle.open("/dev/ttyUSB0", 115200).unwrap();
    handle
}

#[test]
fn line_framing_waits_for_newline() {
    let mock = MockSerial::new();
    let mut handle = open(&mock);

    mock.inject_bytes(b"partial");
    assert_eq!(handle.read_line(), None);

    mock.inject_bytes(b" line\nrest");
    assert_eq!(handle.read_line(), Some(b"partial line\n".to_vec()));
    assert_eq!(handle.read_line(), None);
    assert_eq!(handle.bytes_available(), 4);
}

#[test]
fn write_requires_open_port() {
    let mock = MockSerial::new();
    let mut closed = mock.clone();
    assert!(closed.write(b"x").is_err());

    let mut handle = open(&mock);
    assert_eq!(handle.write(b"help\n").unwrap(), 5);
    assert_eq!(mock.sent(), vec![b"help\n".to_vec()]);
}

#[test]
fn disconnect_after_reads_closes_port() {
    let mock = MockSerial::new();
    let mut handle = open(&mock);
    mock.inject_line("a");
    mock.set_disconnect_after(2);

    assert!(handle.read_line().is_some());
    assert!(handle.read_line().is_none());
    assert!(!handle.is_open());
}

#[test]
fn control_lines_are_recorded_in_order() {
    let mock = MockSerial::new();
    let mut handle = open(&mock);
    handle.set_dtr(false).unwrap();
    handle.set_rts(true).unwrap();
    handle.set_rts(false).unwrap();
    assert_eq!(mock.control_log(), vec![('D', false), ('R', true), ('R', false)]);
}

#[test]
fn port_exists_tracks_available_ports() {
    let mock = MockSerial::new();
    let handle = open(&mock);
    assert!(handle.port_exists("/dev/ttyUSB0"));

    mock.set_available_ports(vec![PortInfo {
        device: "/dev/ttyACM3".into(),
        description: "CP2102 USB to UART".into(),
        hwid: "USB VID:PID=10c4:ea60".into(),
    }]);
    assert!(handle.port_exists("/dev/ttyACM3"));
    assert!(!handle.port_exists("/dev/ttyACM9"));
}
