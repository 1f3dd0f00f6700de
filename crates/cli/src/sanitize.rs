// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serial line sanitization.
//!
//! Logs must stay grep-friendly even when the target emits binary garbage
//! or color codes. Trailing CR/LF is dropped but leading whitespace is
//! preserved — indentation in device output is often meaningful.

use regex::Regex;

/// Cap on a single sanitized line.
const MAX_LINE_CHARS: usize = 20_000;

/// Compiled sanitizer. Construct once, reuse per line.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    // ANSI escape sequences (CSI and two-byte forms). ESP-IDF logs are
    // colorized by default.
    ansi: Regex,
}

impl Sanitizer {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self { ansi: Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])")? })
    }

    /// Remove ANSI escape codes from text.
    pub fn strip_ansi(&self, text: &str) -> String {
        self.ansi.replace_all(text, "").into_owned()
    }

    /// Convert a serial "line" of bytes to safe text for logging.
    ///
    /// - Drops trailing CR/LF only (preserves leading/trailing spaces).
    /// - Removes NUL bytes.
    /// - Decodes as UTF-8 with replacement.
    /// - Strips ANSI escape sequences.
    /// - Escapes remaining control characters (except tab) as `\xNN`.
    /// - Truncates very long lines.
    pub fn sanitize_bytes(&self, data: &[u8]) -> String {
        let mut data = data;
        while let Some((&last, rest)) = data.split_last() {
            if last == b'\r' || last == b'\n' {
                data = rest;
            } else {
                break;
            }
        }

        let cleaned: Vec<u8> = data.iter().copied().filter(|&b| b != 0).collect();
        let text = String::from_utf8_lossy(&cleaned);
        let text = self.strip_ansi(&text);

        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            if ch == '\t' || !ch.is_control() {
                out.push(ch);
            } else {
                let mut buf = [0u8; 4];
                for byte in ch.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\x{byte:02x}"));
                }
            }
        }

        if out.chars().count() > MAX_LINE_CHARS {
            let cut = out
                .char_indices()
                .nth(MAX_LINE_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(out.len());
            out.truncate(cut);
            out.push_str("...[truncated]");
        }
        out
    }
}

#[cfg(test)]
#[path = "sanitize_tests.rs"]
mod tests;
