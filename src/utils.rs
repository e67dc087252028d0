//! Utility functions for the library.
use std::fmt::Write;

/// Escapes a character for display inside a double-quoted literal.
pub(crate) fn escape_literal_char(c: char, out: &mut String) {
    match c {
        '"' => out.push_str("\\\""),
        '\\' => out.push_str("\\\\"),
        _ => escape_common(c, out),
    }
}

/// Escapes a character for display inside a character class.
pub(crate) fn escape_class_char(c: char, out: &mut String) {
    match c {
        ']' | '[' | '-' | '^' | '\\' => {
            out.push('\\');
            out.push(c);
        }
        _ => escape_common(c, out),
    }
}

fn escape_common(c: char, out: &mut String) {
    match c {
        '\n' => out.push_str("\\n"),
        '\r' => out.push_str("\\r"),
        '\t' => out.push_str("\\t"),
        c if c.is_control() => {
            let code = c as u32;
            // Writing into a String never fails.
            let _ = if code <= 0xFF {
                write!(out, "\\x{:02X}", code)
            } else if code <= 0xFFFF {
                write!(out, "\\u{:04X}", code)
            } else {
                write!(out, "\\U{:08X}", code)
            };
        }
        c => out.push(c),
    }
}

/// Renders the bytes of a token for log messages. Bytes that are not valid UTF-8 are shown as `\xHH`.
pub(crate) fn get_display_form_from_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            escape_literal_char(c, &mut out);
        }
        for byte in chunk.invalid() {
            let _ = write!(out, "\\x{:02X}", byte);
        }
    }
    out.push('"');
    out
}

/// Gets the inclusive range of codepoints whose UTF-8 encoding starts with `prefix`,
/// an incomplete but valid multi-byte sequence.
pub(crate) fn utf8_prefix_range(prefix: &[u8]) -> Option<(u32, u32)> {
    let lead = *prefix.first()?;
    let (len, bits, min) = match lead {
        0xC0..=0xDF => (2, lead & 0x1F, 0x80),
        0xE0..=0xEF => (3, lead & 0x0F, 0x800),
        0xF0..=0xF7 => (4, lead & 0x07, 0x10000),
        _ => return None,
    };
    let (mut lo, mut hi) = (bits as u32, bits as u32);
    for i in 1..len {
        let (l, h) = match prefix.get(i) {
            Some(&b) => ((b & 0x3F) as u32, (b & 0x3F) as u32),
            None => (0, 0x3F),
        };
        lo = lo << 6 | l;
        hi = hi << 6 | h;
    }
    let (lo, hi) = (lo.max(min), hi.min(char::MAX as u32));
    (lo <= hi).then_some((lo, hi))
}
