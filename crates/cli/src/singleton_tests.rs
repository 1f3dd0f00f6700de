// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

#[tokio::test]
async fn acquire_writes_pid_and_info() {
    let dir = tempfile::tempdir().unwrap();
    let mut singleton = Singleton::new(dir.path(), "esp32-devkit");

    assert!(
        singleton
            .acquire("/dev/ttyUSB0", dir.path().to_str().unwrap(), "serial", "esp32", false)
            .await
    );
    assert!(singleton.is_held());

    let pid_contents = std::fs::read_to_string(dir.path().join("daemon.pid")).unwrap();
    assert_eq!(pid_contents.trim().parse::<u32>().unwrap(), std::process::id());

    let info = parse_info_file(&dir.path().join("daemon.info"));
    assert_eq!(info.pid, std::process::id() as i32);
    assert_eq!(info.port, "/dev/ttyUSB0");
    assert_eq!(info.device_name, "esp32-devkit");
    assert_eq!(info.chip, "esp32");
}

#[tokio::test]
async fn at_most_one_holder_per_session_dir() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = Singleton::new(dir.path(), "dev");
    let mut second = Singleton::new(dir.path(), "dev");

    assert!(first.acquire("/dev/ttyUSB0", "", "serial", "", false).await);
    assert!(!second.acquire("/dev/ttyUSB0", "", "serial", "", false).await);

    first.release();
    assert!(second.acquire("/dev/ttyUSB0", "", "serial", "", false).await);
}

#[tokio::test]
async fn release_removes_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut singleton = Singleton::new(dir.path(), "dev");
    assert!(singleton.acquire("/dev/ttyS1", "", "serial", "", false).await);

    singleton.release();
    assert!(!dir.path().join("daemon.pid").exists());
    assert!(!dir.path().join("daemon.info").exists());
}

#[tokio::test]
async fn stale_pid_file_is_cleaned_up() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("daemon.pid"), format!("{}\n", i32::MAX - 5)).unwrap();

    let mut singleton = Singleton::new(dir.path(), "dev");
    let existing = singleton.existing().unwrap();
    assert!(!existing.is_alive);

    assert!(singleton.acquire("/dev/ttyS0", "", "serial", "", false).await);
}

#[tokio::test]
async fn existing_reports_live_holder() {
    let dir = tempfile::tempdir().unwrap();
    let mut holder = Singleton::new(dir.path(), "dev");
    assert!(holder.acquire("/dev/ttyUSB9", "", "serial", "nrf5340", false).await);

    let observed = check_singleton(dir.path(), "dev").unwrap();
    assert!(observed.is_alive);
    assert_eq!(observed.pid, std::process::id() as i32);
    assert_eq!(observed.port, "/dev/ttyUSB9");
}

#[tokio::test]
async fn kill_existing_cleans_stale_state() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("daemon.pid"), format!("{}\n", i32::MAX - 3)).unwrap();
    write_info_file(&dir.path().join("daemon.info"), i32::MAX - 3, "", "", "dev", "serial", "")
        .unwrap();

    assert!(kill_existing_daemon(dir.path(), Duration::from_secs(1)).await);
    assert!(!dir.path().join("daemon.pid").exists());
    assert!(!dir.path().join("daemon.info").exists());
}

#[test]
fn info_file_roundtrip_ignores_unknown_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daemon.info");
    write_info_file(&path, 42, "/dev/ttyACM0", "/tmp/x", "board", "serial", "stm32l476rg").unwrap();

    let mut contents = std::fs::read_to_string(&path).unwrap();
    contents.push_str("future_key=whatever\n");
    std::fs::write(&path, contents).unwrap();

    let info = parse_info_file(&path);
    assert_eq!(info.pid, 42);
    assert_eq!(info.chip, "stm32l476rg");
    assert_eq!(info.device_type, "serial");
}
