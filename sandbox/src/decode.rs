//! Percent-decoding pass applied to raw names before any path logic sees them.

use std::borrow::Cow;

use percent_encoding::percent_decode_str;

const MAX_DECODE_DEPTH: usize = 8;

/// Decodes `raw` exactly once, URI-component style.
///
/// A `%` without two hex digits after it, or a result that is not valid
/// UTF-8, counts as malformed and the raw string is returned unchanged.
pub fn decode_once(raw: &str) -> Cow<'_, str> {
    if !is_well_formed(raw) {
        return Cow::Borrowed(raw);
    }
    percent_decode_str(raw)
        .decode_utf8()
        .unwrap_or(Cow::Borrowed(raw))
}

/// True when `raw` holds a NUL either literally or behind one layer of
/// escaping, whether or not the full decode pass succeeded.
pub fn carries_nul(raw: &str) -> bool {
    raw.contains('\0') || percent_decode_str(raw).any(|b| b == 0)
}

/// Reports whether an already-decoded string still carries escapes that
/// would turn into `.`, a separator or NUL on a later decode, at any depth.
pub fn hides_encoded_traversal(decoded: &str) -> bool {
    let mut current = Cow::Borrowed(decoded);
    for _ in 0..MAX_DECODE_DEPTH {
        if escaped_bytes(&current).any(|b| matches!(b, b'.' | b'/' | b'\\' | 0)) {
            return true;
        }
        let next = percent_decode_str(&current).decode_utf8_lossy().into_owned();
        if next == current {
            return false;
        }
        current = Cow::Owned(next);
    }
    // Still unwrapping layers after the depth limit.
    true
}

fn is_well_formed(input: &str) -> bool {
    let bytes = input.as_bytes();
    bytes.iter().enumerate().all(|(i, &b)| {
        b != b'%'
            || matches!(
                (bytes.get(i + 1), bytes.get(i + 2)),
                (Some(hi), Some(lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit()
            )
    })
}

fn escaped_bytes(input: &str) -> impl Iterator<Item = u8> + '_ {
    let bytes = input.as_bytes();
    bytes.iter().enumerate().filter_map(move |(i, &b)| {
        if b != b'%' {
            return None;
        }
        let hi = hex_value(*bytes.get(i + 1)?)?;
        let lo = hex_value(*bytes.get(i + 2)?)?;
        Some((hi << 4) | lo)
    })
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
