//! Smol utilities for logging

use std::ascii;

/// Make an Ascii-safe string out of untrusted child output
pub fn ascii_escape(s: &[u8]) -> String {
    String::from_utf8(
        s.iter().flat_map(|&b| ascii::escape_default(b)).collect()
    ).unwrap()
}

#[test]
fn escape_keeps_printables() {
    assert_eq!(ascii_escape(b"hello"), "hello");
}

#[test]
fn escape_mangles_control_bytes() {
    assert_eq!(ascii_escape(b"a\r\nb\x00"), "a\\r\\nb\\x00");
}
