// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Real serial device backed by the `serialport` crate.
//!
//! The underlying handle is blocking, so every read first checks
//! `bytes_to_read` and only pulls what is already queued — the daemon's
//! poll loop never blocks on the device. Incoming bytes are framed into
//! lines by an internal buffer.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tracing::debug;

use super::{PortInfo, SerialPort};

/// Read timeout for the blocking handle. Reads are gated on
/// `bytes_to_read`, so this only bounds pathological driver stalls.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

pub struct SerialDevice {
    handle: Option<Box<dyn serialport::SerialPort>>,
    line_buf: Vec<u8>,
}

impl SerialDevice {
    pub fn new() -> Self {
        Self { handle: None, line_buf: Vec::new() }
    }

    /// Pull whatever the driver has queued into the framing buffer.
    fn fill_buf(&mut self) {
        let Some(ref mut handle) = self.handle else {
            return;
        };
        let waiting = handle.bytes_to_read().unwrap_or(0) as usize;
        if waiting == 0 {
            return;
        }
        let mut chunk = vec![0u8; waiting.min(4096)];
        match handle.read(&mut chunk) {
            Ok(n) => self.line_buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                debug!("serial read error: {e}");
            }
        }
    }
}

impl Default for SerialDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialPort for SerialDevice {
    fn open(&mut self, port: &str, baud: u32) -> anyhow::Result<()> {
        let handle = serialport::new(port, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .with_context(|| format!("failed to open {port} at {baud} baud"))?;
        self.handle = Some(handle);
        self.line_buf.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.handle = None;
        self.line_buf.clear();
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn read_line(&mut self) -> Option<Vec<u8>> {
        self.fill_buf();
        let newline = self.line_buf.iter().position(|&b| b == b'\n')?;
        Some(self.line_buf.drain(..=newline).collect())
    }

    fn read_bytes(&mut self, max: usize) -> Bytes {
        if max == 0 {
            return Bytes::new();
        }
        self.fill_buf();
        let take = self.line_buf.len().min(max);
        let chunk: Vec<u8> = self.line_buf.drain(..take).collect();
        Bytes::from(chunk)
    }

    fn write(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        let handle = self.handle.as_mut().context("port not open")?;
        let written = handle.write(data)?;
        handle.flush()?;
        Ok(written)
    }

    fn bytes_available(&self) -> usize {
        let queued = self
            .handle
            .as_ref()
            .and_then(|h| h.bytes_to_read().ok())
            .unwrap_or(0) as usize;
        queued + self.line_buf.len()
    }

    fn set_dtr(&mut self, level: bool) -> anyhow::Result<()> {
        let handle = self.handle.as_mut().context("port not open")?;
        handle.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> anyhow::Result<()> {
        let handle = self.handle.as_mut().context("port not open")?;
        handle.write_request_to_send(level)?;
        Ok(())
    }

    fn list_ports(&self) -> Vec<PortInfo> {
        list_ports()
    }

    fn port_exists(&self, port: &str) -> bool {
        std::path::Path::new(port).exists()
    }
}

/// Enumerate serial ports visible to the OS.
pub fn list_ports() -> Vec<PortInfo> {
    let Ok(ports) = serialport::available_ports() else {
        return Vec::new();
    };
    ports
        .into_iter()
        .map(|p| {
            let (description, hwid) = match p.port_type {
                serialport::SerialPortType::UsbPort(ref usb) => (
                    usb.product.clone().unwrap_or_default(),
                    format!(
                        "USB VID:PID={:04x}:{:04x}{}",
                        usb.vid,
                        usb.pid,
                        usb.serial_number
                            .as_deref()
                            .map(|s| format!(" SER={s}"))
                            .unwrap_or_default()
                    ),
                ),
                serialport::SerialPortType::BluetoothPort => ("Bluetooth".to_owned(), String::new()),
                serialport::SerialPortType::PciPort => ("PCI".to_owned(), String::new()),
                serialport::SerialPortType::Unknown => (String::new(), String::new()),
            };
            PortInfo { device: p.port_name, description, hwid }
        })
        .collect()
}
