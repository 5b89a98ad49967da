//! Conversion between UTF-16 code units and UTF-8 bytes.
//!
//! Malformed input never fails: unpaired surrogates and invalid byte
//! sequences decode to U+FFFD, so a round trip always yields a valid
//! string. This matches how the VM surfaces strings to the outside world
//! (module names in diagnostics, program output).

use crate::unicode;

/// Encodes a UTF-16 code-unit sequence as UTF-8.
///
/// Unpaired surrogates are replaced with U+FFFD.
pub fn utf16_to_utf8(units: &[u16]) -> Vec<u8> {
    let mut out = String::with_capacity(units.len());
    for ch in char::decode_utf16(units.iter().copied()) {
        out.push(ch.unwrap_or(char::REPLACEMENT_CHARACTER));
    }
    out.into_bytes()
}

/// Decodes UTF-8 bytes into UTF-16 code units.
///
/// Invalid byte sequences are replaced with U+FFFD.
pub fn utf8_to_utf16(bytes: &[u8]) -> Vec<u16> {
    let text = String::from_utf8_lossy(bytes);
    let mut out = Vec::with_capacity(bytes.len());
    for ch in text.chars() {
        let cp = ch as u32;
        if unicode::needs_surrogate_pair(cp) {
            let pair = unicode::to_surrogate_pair(cp);
            out.push(pair.lead);
            out.push(pair.trail);
        } else {
            out.push(cp as u16);
        }
    }
    out
}

/// Encodes a Rust string as UTF-16 code units.
pub fn str_to_utf16(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

/// Decodes UTF-16 code units into a Rust string, replacing unpaired
/// surrogates with U+FFFD.
pub fn utf16_to_string(units: &[u16]) -> String {
    char::decode_utf16(units.iter().copied())
        .map(|ch| ch.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_round_trip() {
        let units = str_to_utf16("hello, world");
        let bytes = utf16_to_utf8(&units);
        assert_eq!(bytes, b"hello, world");
        assert_eq!(utf8_to_utf16(&bytes), units);
    }

    #[test]
    fn test_astral_round_trip() {
        let units = str_to_utf16("a\u{1F600}b");
        assert_eq!(units.len(), 4); // surrogate pair in the middle
        let bytes = utf16_to_utf8(&units);
        assert_eq!(utf8_to_utf16(&bytes), units);
    }

    #[test]
    fn test_unpaired_surrogate_replaced() {
        let units = [b'a' as u16, 0xD800, b'b' as u16];
        let bytes = utf16_to_utf8(&units);
        let back = utf8_to_utf16(&bytes);
        assert_eq!(back, vec![b'a' as u16, unicode::REPLACEMENT_CHAR, b'b' as u16]);
    }

    #[test]
    fn test_malformed_utf8_replaced() {
        let bytes = [b'a', 0xFF, b'b'];
        let units = utf8_to_utf16(&bytes);
        assert_eq!(units, vec![b'a' as u16, unicode::REPLACEMENT_CHAR, b'b' as u16]);
    }
}
