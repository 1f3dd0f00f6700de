// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory serial port for tests and the end-to-end specs.
//!
//! Shared-handle design: a [`MockSerial`] can be cloned, one clone handed
//! to the daemon as its `Box<dyn SerialPort>` while the test keeps the
//! other to inject received lines and inspect written bytes.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::bail;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{PortInfo, SerialPort};

#[derive(Default)]
struct Shared {
    is_open: bool,
    port: String,
    baud: u32,
    rx: VecDeque<u8>,
    tx: Vec<Vec<u8>>,
    fail_on_open: bool,
    disconnect_after_reads: Option<u32>,
    read_count: u32,
    available_ports: Vec<PortInfo>,
    control_log: Vec<(char, bool)>,
}

#[derive(Clone, Default)]
pub struct MockSerial {
    shared: Arc<Mutex<Shared>>,
}

impl MockSerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a line (newline appended) into the receive buffer.
    pub fn inject_line(&self, line: &str) {
        let mut s = self.shared.lock();
        s.rx.extend(line.as_bytes());
        s.rx.push_back(b'\n');
    }

    /// Queue raw bytes into the receive buffer.
    pub fn inject_bytes(&self, data: &[u8]) {
        self.shared.lock().rx.extend(data);
    }

    /// Everything written through the port so far, one entry per write.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.shared.lock().tx.clone()
    }

    pub fn clear_sent(&self) {
        self.shared.lock().tx.clear();
    }

    pub fn set_fail_on_open(&self, fail: bool) {
        self.shared.lock().fail_on_open = fail;
    }

    /// Simulate the device dropping off the bus after N reads.
    pub fn set_disconnect_after(&self, reads: u32) {
        let mut s = self.shared.lock();
        s.disconnect_after_reads = Some(reads);
        s.read_count = 0;
    }

    /// Simulate USB re-enumeration: the device path is gone and the
    /// handle is dead.
    pub fn remove_port(&self) {
        let mut s = self.shared.lock();
        s.is_open = false;
        s.port.clear();
    }

    pub fn set_available_ports(&self, ports: Vec<PortInfo>) {
        self.shared.lock().available_ports = ports;
    }

    /// DTR/RTS transitions in the order they were applied.
    pub fn control_log(&self) -> Vec<(char, bool)> {
        self.shared.lock().control_log.clone()
    }

    pub fn opened_with(&self) -> (String, u32) {
        let s = self.shared.lock();
        (s.port.clone(), s.baud)
    }
}

impl SerialPort for MockSerial {
    fn open(&mut self, port: &str, baud: u32) -> anyhow::Result<()> {
        let mut s = self.shared.lock();
        if s.fail_on_open {
            bail!("mock open failure for {port}");
        }
        s.port = port.to_owned();
        s.baud = baud;
        s.is_open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.shared.lock().is_open = false;
    }

    fn is_open(&self) -> bool {
        self.shared.lock().is_open
    }

    fn read_line(&mut self) -> Option<Vec<u8>> {
        let mut s = self.shared.lock();
        if !s.is_open {
            return None;
        }
        s.read_count += 1;
        if let Some(after) = s.disconnect_after_reads {
            if s.read_count >= after {
                s.is_open = false;
                s.disconnect_after_reads = None;
                return None;
            }
        }
        let newline = s.rx.iter().position(|&b| b == b'\n')?;
        Some(s.rx.drain(..=newline).collect())
    }

    fn read_bytes(&mut self, max: usize) -> Bytes {
        let mut s = self.shared.lock();
        if !s.is_open || max == 0 {
            return Bytes::new();
        }
        let take = s.rx.len().min(max);
        let chunk: Vec<u8> = s.rx.drain(..take).collect();
        Bytes::from(chunk)
    }

    fn write(&mut self, data: &[u8]) -> anyhow::Result<usize> {
        let mut s = self.shared.lock();
        if !s.is_open {
            bail!("mock port not open");
        }
        s.tx.push(data.to_vec());
        Ok(data.len())
    }

    fn bytes_available(&self) -> usize {
        self.shared.lock().rx.len()
    }

    fn set_dtr(&mut self, level: bool) -> anyhow::Result<()> {
        self.shared.lock().control_log.push(('D', level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> anyhow::Result<()> {
        self.shared.lock().control_log.push(('R', level));
        Ok(())
    }

    fn list_ports(&self) -> Vec<PortInfo> {
        self.shared.lock().available_ports.clone()
    }

    fn port_exists(&self, port: &str) -> bool {
        let s = self.shared.lock();
        s.available_ports.iter().any(|p| p.device == port) || (!s.port.is_empty() && s.port == port)
    }
}

#[cfg(test)]
#[path = "mock_tests.rs"]
mod tests;
