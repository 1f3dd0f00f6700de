// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::*;
use crate::ports::FakeClock;

fn logger(dir: &Path, rotation: RotationConfig) -> (SessionLogger, Arc<FakeClock>) {
    let clock = Arc::new(FakeClock::new());
    let log = SessionLogger::new(clock.clone(), dir, rotation).unwrap();
    (log, clock)
}

fn read_log(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("latest.log")).unwrap()
}

#[test]
fn header_and_timestamped_lines() {
    let dir = tempfile::tempdir().unwrap();
    let (mut log, _clock) = logger(dir.path(), RotationConfig::default());

    log.start_session("/dev/ttyUSB0", 115200).unwrap();
    log.log_line("hello");

    let contents = read_log(dir.path());
    assert!(contents.contains("SESSION: serial_"));
    assert!(contents.contains("PORT: /dev/ttyUSB0"));
    assert!(contents.contains("BAUD: 115200"));

    let line = contents.lines().last().unwrap();
    // [HH:MM:SS.mmm] hello
    assert_eq!(line.as_bytes()[0], b'[');
    assert_eq!(line.as_bytes()[13], b']');
    assert!(line.ends_with("] hello"));
    assert_eq!(log.lines_logged(), 1);
}

#[test]
fn commands_get_cmd_marker() {
    let dir = tempfile::tempdir().unwrap();
    let (mut log, _clock) = logger(dir.path(), RotationConfig::default());
    log.start_session("/dev/ttyUSB0", 115200).unwrap();

    log.log_command("help");
    assert!(read_log(dir.path()).contains(">>> CMD: help"));
    assert_eq!(log.commands_sent(), 1);
}

#[test]
fn ansi_is_stripped_from_entries() {
    let dir = tempfile::tempdir().unwrap();
    let (mut log, _clock) = logger(dir.path(), RotationConfig::default());
    log.start_session("/dev/ttyUSB0", 115200).unwrap();

    log.log_line("\x1b[0;31mE (12) boot: bad\x1b[0m");
    let contents = read_log(dir.path());
    assert!(contents.contains("E (12) boot: bad"));
    assert!(!contents.contains('\x1b'));
}

#[test]
fn footer_reports_duration_and_counts() {
    let dir = tempfile::tempdir().unwrap();
    let (mut log, clock) = logger(dir.path(), RotationConfig::default());
    log.start_session("/dev/ttyUSB0", 115200).unwrap();

    log.log_line("one");
    log.log_command("two");
    clock.advance(std::time::Duration::from_secs(3723));
    log.end_session();

    let contents = read_log(dir.path());
    assert!(contents.contains("DURATION: 1h 2m 03s"));
    assert!(contents.contains("LINES LOGGED: 1"));
    assert!(contents.contains("COMMANDS SENT: 1"));
}

#[test]
fn restart_archives_previous_log() {
    let dir = tempfile::tempdir().unwrap();
    let rotation = RotationConfig { compress: false, ..RotationConfig::default() };
    let (mut log, _clock) = logger(dir.path(), rotation);

    log.start_session("/dev/ttyUSB0", 115200).unwrap();
    log.log_line("first session");
    log.start_session("/dev/ttyUSB0", 115200).unwrap();

    let archived = std::fs::read_to_string(dir.path().join("latest.log.1")).unwrap();
    assert!(archived.contains("first session"));
    assert!(!read_log(dir.path()).contains("first session"));
}

#[test]
fn recent_ring_keeps_newest() {
    let dir = tempfile::tempdir().unwrap();
    let (mut log, _clock) = logger(dir.path(), RotationConfig::default());
    log.start_session("/dev/ttyUSB0", 115200).unwrap();

    for i in 0..600 {
        log.log_line(&format!("line-{i}"));
    }
    let recent = log.recent_lines(10);
    assert_eq!(recent.len(), 10);
    assert!(recent[9].ends_with("line-599"));
    assert!(recent[0].ends_with("line-590"));
}

#[test]
fn rotation_respects_max_files_and_single_form_per_slot() {
    let dir = tempfile::tempdir().unwrap();
    let rotation = RotationConfig { max_size_bytes: 1_000, max_files: 3, compress: true };
    let (mut log, _clock) = logger(dir.path(), rotation);
    log.start_session("/dev/ttyUSB0", 115200).unwrap();

    // ~5000 bytes of content triggers several rotations.
    for i in 0..100 {
        log.log_line(&format!("payload line {i:04} ================================"));
    }

    let entries: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();

    assert!(entries.contains(&"latest.log".to_owned()));
    for i in 1..=3u32 {
        let plain = format!("latest.log.{i}");
        let gz = format!("latest.log.{i}.gz");
        let forms = entries.iter().filter(|n| **n == plain || **n == gz).count();
        assert!(forms <= 1, "slot {i} has both forms: {entries:?}");
    }
    assert!(!entries.contains(&"latest.log.4".to_owned()));
    assert!(!entries.contains(&"latest.log.4.gz".to_owned()));

    // The current file was reset by the last rotation.
    assert!(std::fs::metadata(dir.path().join("latest.log")).unwrap().len() < 1_000);
}

#[test]
fn rotation_shifts_oldest_first_without_data_loss() {
    let dir = tempfile::tempdir().unwrap();
    let rotation = RotationConfig { max_size_bytes: 50, max_files: 2, compress: false };
    let (mut log, _clock) = logger(dir.path(), rotation);
    log.start_session("/dev/ttyUSB0", 115200).unwrap();

    // Each entry exceeds the threshold on its own, so each line forces a
    // rotation: A lands in .1, then is shifted to .2 when B rotates in.
    log.log_line("generation-A padding padding padding padding padding padding padding");
    log.log_line("generation-B padding padding padding padding padding padding padding");
    let one = std::fs::read_to_string(dir.path().join("latest.log.1")).unwrap();
    let two = std::fs::read_to_string(dir.path().join("latest.log.2")).unwrap();
    assert!(one.contains("generation-B"));
    assert!(two.contains("generation-A"));
}
