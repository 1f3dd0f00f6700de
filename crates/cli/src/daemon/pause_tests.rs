// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

fn gate(dir: &Path) -> PauseGate {
    PauseGate::new(dir)
}

#[test]
fn no_file_means_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut g = gate(dir.path());
    assert_eq!(g.check(1000.0), PauseAction::Run);
    assert!(!g.is_paused());
}

#[test]
fn future_deadline_enters_then_holds() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pause.txt"), "1010.5").unwrap();
    let mut g = gate(dir.path());

    match g.check(1000.0) {
        PauseAction::Enter { deadline, sleep } => {
            assert_eq!(deadline, 1010.5);
            assert_eq!(sleep, Duration::from_millis(500));
        }
        other => panic!("expected Enter, got {other:?}"),
    }
    assert!(g.is_paused());

    // Near the deadline the poll tightens.
    match g.check(1008.0) {
        PauseAction::Hold { sleep } => assert_eq!(sleep, Duration::from_millis(100)),
        other => panic!("expected Hold, got {other:?}"),
    }
}

#[test]
fn expiry_removes_file_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pause.txt");
    std::fs::write(&path, "1002").unwrap();
    let mut g = gate(dir.path());

    g.check(1000.0);
    match g.check(1002.5) {
        PauseAction::Resume { paused_for } => assert!((paused_for - 2.5).abs() < 1e-9),
        other => panic!("expected Resume, got {other:?}"),
    }
    assert!(!path.exists());
    assert!(!g.is_paused());
}

#[test]
fn deleting_the_file_resumes_early() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pause.txt");
    std::fs::write(&path, "2000").unwrap();
    let mut g = gate(dir.path());

    g.check(1000.0);
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(g.check(1001.0), PauseAction::Resume { .. }));
}

#[test]
fn rewriting_with_later_deadline_extends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pause.txt");
    std::fs::write(&path, "1005").unwrap();
    let mut g = gate(dir.path());

    g.check(1000.0);
    std::fs::write(&path, "1050").unwrap();
    assert!(matches!(g.check(1004.0), PauseAction::Hold { .. }));
    assert!(matches!(g.check(1006.0), PauseAction::Hold { .. }));
    assert!(matches!(g.check(1051.0), PauseAction::Resume { .. }));
}

#[test]
fn junk_content_is_cleared_and_not_a_pause() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pause.txt");
    std::fs::write(&path, "not-a-number").unwrap();
    let mut g = gate(dir.path());

    assert_eq!(g.check(1000.0), PauseAction::Run);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
}

#[test]
fn original_port_bookkeeping() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pause.txt"), "1010").unwrap();
    let mut g = gate(dir.path());

    g.check(1000.0);
    g.mark_entered("/dev/ttyUSB0");
    assert_eq!(g.original_port(), Some("/dev/ttyUSB0"));

    g.check(1011.0);
    g.mark_resumed();
    assert_eq!(g.original_port(), None);
}
