//! Transfer escaping for delimiter-form parameters.
//!
//! Bytes that would break framing or parameter splitting are written as
//! `%XX` (uppercase hex). `%` itself is always escaped so decoding is
//! unambiguous.

use std::borrow::Cow;
use std::fmt::Write;

use super::fields::{JSON_START_ARRAY, SEPARATOR};
use crate::error::{AggError, Result};
use crate::protocol::{END_BYTE, START_BYTE};

const ESCAPE: u8 = b'%';

#[inline]
fn needs_escape(b: u8) -> bool {
    matches!(b, ESCAPE | SEPARATOR | START_BYTE | END_BYTE | 0)
}

/// Escape one parameter. `first` marks parameter 0, whose leading `[`
/// would otherwise be mistaken for the JSON form.
pub fn encode(param: &str, first: bool) -> Cow<'_, str> {
    let bytes = param.as_bytes();
    let leading_marker = first && bytes.first() == Some(&JSON_START_ARRAY);
    if !leading_marker && !bytes.iter().copied().any(needs_escape) {
        return Cow::Borrowed(param);
    }

    let mut out = String::with_capacity(param.len() + 8);
    for (i, ch) in param.char_indices() {
        let escape = ch.is_ascii() && (needs_escape(ch as u8) || (i == 0 && leading_marker));
        if escape {
            let _ = write!(out, "%{:02X}", ch as u8);
        } else {
            out.push(ch);
        }
    }
    Cow::Owned(out)
}

/// Reverse of [`encode`].
pub fn decode(param: &str) -> Result<Cow<'_, str>> {
    if !param.as_bytes().contains(&ESCAPE) {
        return Ok(Cow::Borrowed(param));
    }

    let bytes = param.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == ESCAPE {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    AggError::Protocol(format!("Invalid escape sequence at offset {}", i))
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out)
        .map(Cow::Owned)
        .map_err(|e| AggError::Protocol(format!("Invalid UTF-8 after unescaping: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_borrowed() {
        assert!(matches!(encode("hello world", false), Cow::Borrowed(_)));
        assert!(matches!(decode("hello world").unwrap(), Cow::Borrowed(_)));
    }

    #[test]
    fn test_special_bytes_escaped() {
        let raw = "a%b\u{17}c\u{2}d\re\0";
        let encoded = encode(raw, false);
        assert_eq!(encoded, "a%25b%17c%02d%0De%00");
        assert_eq!(decode(&encoded).unwrap(), raw);
    }

    #[test]
    fn test_leading_marker_only_on_first_param() {
        assert_eq!(encode("[1,2]", true), "%5B1,2]");
        assert_eq!(encode("[1,2]", false), "[1,2]");
        assert_eq!(decode("%5B1,2]").unwrap(), "[1,2]");
    }

    #[test]
    fn test_unicode_preserved() {
        let raw = "zażółć % gęślą";
        assert_eq!(decode(&encode(raw, false)).unwrap(), raw);
    }

    #[test]
    fn test_bad_escape() {
        assert!(decode("abc%4").is_err());
        assert!(decode("abc%zz").is_err());
    }
}
