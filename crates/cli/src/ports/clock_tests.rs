// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::*;

#[test]
fn fake_clock_advances() {
    let clock = FakeClock::new();
    let before = clock.now();
    clock.advance(Duration::from_secs(90));
    assert_eq!((clock.now() - before).num_seconds(), 90);
}

#[test]
fn fake_clock_timestamp_tracks_now() {
    let clock = FakeClock::new();
    let t0 = clock.timestamp();
    clock.advance(Duration::from_millis(2500));
    let t1 = clock.timestamp();
    assert!((t1 - t0 - 2.5).abs() < 0.001);
}

#[test]
fn system_clock_is_monotonic_enough() {
    let clock = SystemClock;
    let a = clock.timestamp();
    let b = clock.timestamp();
    assert!(b >= a);
}
