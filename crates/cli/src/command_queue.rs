// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Crash-safe command FIFO on `cmd.txt`.
//!
//! Writers append one command per line under an exclusive flock; the
//! daemon drains by reading and truncating inside one critical section,
//! so commands are consumed exactly once. Both sides of the protocol use
//! this module (the daemon loop and the `eab cmd` operator path).

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::Context;
use nix::fcntl::{Flock, FlockArg};

/// Append a single command, newline-delimited. Empty input is ignored.
pub fn append_command(cmd_path: &Path, command: &str) -> anyhow::Result<()> {
    let normalized = command.trim_end_matches('\n');
    if normalized.is_empty() {
        return Ok(());
    }

    if let Some(parent) = cmd_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(cmd_path)
        .with_context(|| format!("could not open {}", cmd_path.display()))?;

    let mut locked = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_f, errno)| anyhow::anyhow!("flock failed: {errno}"))?;
    locked.write_all(normalized.as_bytes())?;
    locked.write_all(b"\n")?;
    locked.flush()?;
    locked.sync_all()?;
    Ok(())
}

/// Drain all queued commands in write order; the file is truncated under
/// the same lock before returning.
pub fn drain_commands(cmd_path: &Path) -> anyhow::Result<Vec<String>> {
    if !cmd_path.exists() {
        return Ok(Vec::new());
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(cmd_path)
        .with_context(|| format!("could not open {}", cmd_path.display()))?;

    let mut locked = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_f, errno)| anyhow::anyhow!("flock failed: {errno}"))?;

    let mut contents = String::new();
    locked.read_to_string(&mut contents)?;
    locked.seek(SeekFrom::Start(0))?;
    locked.set_len(0)?;
    locked.sync_all()?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
#[path = "command_queue_tests.rs"]
mod tests;
