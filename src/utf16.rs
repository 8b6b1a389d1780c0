//! UTF-16 codec for the sparse header's parent name field.

use crate::{Result, VhdError};

/// Encode to big-endian UTF-16, no BOM, no terminator.
pub fn encode_be(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    let mut units = [0u16; 2];
    for ch in s.chars() {
        for unit in ch.encode_utf16(&mut units) {
            out.extend_from_slice(&unit.to_be_bytes());
        }
    }
    out
}

/// Decode a fixed-size name field.
///
/// A leading `FE FF` selects big-endian (and is consumed), `FF FE` selects
/// little-endian; anything else is big-endian from the first byte. Decoding
/// stops at the first U+0000.
pub fn decode(buf: &[u8]) -> Result<String> {
    let (big_endian, body) = match buf {
        [0xFE, 0xFF, rest @ ..] => (true, rest),
        [0xFF, 0xFE, rest @ ..] => (false, rest),
        _ => (true, buf),
    };

    let mut units = Vec::with_capacity(body.len() / 2);
    for pair in body.chunks_exact(2) {
        let unit = if big_endian {
            u16::from_be_bytes([pair[0], pair[1]])
        } else {
            u16::from_le_bytes([pair[0], pair[1]])
        };
        if unit == 0 {
            break;
        }
        units.push(unit);
    }

    char::decode_utf16(units.into_iter())
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| VhdError::InvalidUtf16("unpaired surrogate"))
}

/// Decode little-endian UTF-16 with no BOM, stopping at the first U+0000.
/// Used for the `W2ku`/`W2ru` parent locator payloads.
pub fn decode_le(buf: &[u8]) -> Result<String> {
    let mut units = Vec::with_capacity(buf.len() / 2);
    for pair in buf.chunks_exact(2) {
        let unit = u16::from_le_bytes([pair[0], pair[1]]);
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    char::decode_utf16(units.into_iter())
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| VhdError::InvalidUtf16("unpaired surrogate"))
}
