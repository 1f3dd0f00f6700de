// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Binary capture mode.
//!
//! `stream.json` in the session directory configures capture; incoming
//! bytes are appended to `data.bin` and described by offset/length/crc32
//! metadata in stream events. Lines that are clearly base64 payload are
//! treated as opaque so the pattern bank and chip recovery do not false-
//! positive on encoded blobs.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::status::StreamSection;

/// Agent-written capture configuration (`stream.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub enabled: bool,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// When set, capture stays armed until a line contains this marker.
    #[serde(default)]
    pub marker: Option<String>,
    /// Keep running the pattern bank on lines while capturing.
    #[serde(default = "default_true")]
    pub pattern_matching: bool,
}

fn default_mode() -> String {
    "raw".to_owned()
}

fn default_chunk_size() -> usize {
    4096
}

fn default_true() -> bool {
    true
}

impl StreamConfig {
    /// Load from a session dir; `None` when absent or unparseable.
    pub fn load(session_dir: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(session_dir.join("stream.json")).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn to_section(&self, active: bool) -> StreamSection {
        StreamSection {
            enabled: self.enabled,
            active,
            mode: self.mode.clone(),
            chunk_size: self.chunk_size,
            marker: self.marker.clone(),
            pattern_matching: self.pattern_matching,
        }
    }
}

/// Metadata describing one appended chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkInfo {
    pub offset: u64,
    pub length: usize,
    pub crc32: String,
}

/// Append-only binary writer with offset tracking.
pub struct DataStreamWriter {
    data_path: PathBuf,
    offset: u64,
}

impl DataStreamWriter {
    pub fn new(session_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(session_dir)?;
        let data_path = session_dir.join("data.bin");
        let offset = std::fs::metadata(&data_path).map(|m| m.len()).unwrap_or(0);
        Ok(Self { data_path, offset })
    }

    pub fn current_offset(&self) -> u64 {
        self.offset
    }

    pub fn append(&mut self, chunk: &[u8]) -> anyhow::Result<ChunkInfo> {
        if chunk.is_empty() {
            return Ok(ChunkInfo { offset: self.offset, length: 0, crc32: "0".to_owned() });
        }

        let offset = self.offset;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.data_path)?;
        file.write_all(chunk)?;
        file.flush()?;

        self.offset += chunk.len() as u64;
        Ok(ChunkInfo {
            offset,
            length: chunk.len(),
            crc32: format!("{:08x}", crc32(chunk)),
        })
    }

    pub fn truncate(&mut self) -> anyhow::Result<()> {
        std::fs::write(&self.data_path, b"")?;
        self.offset = 0;
        Ok(())
    }
}

/// Conservative payload heuristic: at least 16 chars, exclusively the
/// base64 alphabet (with optional padding), and a clean strict decode.
/// Ordinary firmware text fails at least one of these.
pub fn looks_like_base64_payload(line: &str) -> bool {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.len() < 16 {
        return false;
    }
    if !trimmed
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
    {
        return false;
    }
    base64::engine::general_purpose::STANDARD.decode(trimmed).is_ok()
}

/// CRC-32 (IEEE 802.3, reflected) over a chunk.
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[cfg(test)]
#[path = "stream_tests.rs"]
mod tests;
