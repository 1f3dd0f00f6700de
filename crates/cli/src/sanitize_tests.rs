// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use proptest::prelude::*;

use super::*;

fn sanitizer() -> Sanitizer {
    Sanitizer::new().unwrap()
}

#[test]
fn strips_ansi_color_codes() {
    let s = sanitizer();
    assert_eq!(
        s.sanitize_bytes(b"\x1b[0;32mI (123) main: started\x1b[0m\r\n"),
        "I (123) main: started"
    );
}

#[test]
fn preserves_leading_whitespace() {
    let s = sanitizer();
    assert_eq!(s.sanitize_bytes(b"    indented frame\n"), "    indented frame");
}

#[test]
fn drops_nul_and_escapes_control_bytes() {
    let s = sanitizer();
    assert_eq!(s.sanitize_bytes(b"a\x00b\x07c\td\n"), "ab\\x07c\td");
}

#[test]
fn truncates_very_long_lines() {
    let s = sanitizer();
    let long = vec![b'x'; 25_000];
    let out = s.sanitize_bytes(&long);
    assert!(out.ends_with("...[truncated]"));
    assert_eq!(out.chars().count(), 20_000 + "...[truncated]".chars().count());
}

#[test]
fn lossy_decode_of_invalid_utf8() {
    let s = sanitizer();
    let out = s.sanitize_bytes(b"ok \xff\xfe bytes\r\n");
    assert!(out.starts_with("ok "));
    assert!(out.ends_with(" bytes"));
}

proptest! {
    // Whatever comes off the wire, the sanitized form never contains raw
    // control characters (other than tab) and never exceeds the cap.
    #[test]
    fn sanitized_output_is_printable(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let s = sanitizer();
        let out = s.sanitize_bytes(&data);
        prop_assert!(out.chars().all(|c| c == '\t' || !c.is_control()));
        prop_assert!(out.chars().count() <= 20_000 + "...[truncated]".chars().count());
    }

    #[test]
    fn plain_ascii_roundtrips(text in "[ -~]{0,200}") {
        let s = sanitizer();
        let trimmed = text.trim_end_matches(['\r', '\n']).to_owned();
        prop_assert_eq!(s.sanitize_bytes(text.as_bytes()), trimmed);
    }
}
