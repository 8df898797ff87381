//! Text encodings recognised in meter data files

use serde::{Deserialize, Serialize};
use std::fmt;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16LE_BOM: &[u8] = &[0xFF, 0xFE];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "utf-16-le")]
    Utf16Le,
    #[serde(rename = "latin-1")]
    Latin1,
    #[serde(rename = "binary")]
    Binary,
}

/// Candidate order used when nothing else is known about a file
pub const CANDIDATE_ENCODINGS: [TextEncoding; 3] =
    [TextEncoding::Utf8, TextEncoding::Utf16Le, TextEncoding::Latin1];

impl TextEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Utf16Le => "utf-16-le",
            Self::Latin1 => "latin-1",
            Self::Binary => "binary",
        }
    }

    /// Decode `bytes`, tolerating a sequence cut off at the end of the buffer
    ///
    /// Detection only sees the head of a file, so the last character may be
    /// incomplete. Anything malformed before that point is a failed decode.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Self::Utf8 => decode_utf8(bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes)),
            Self::Utf16Le => decode_utf16le(bytes),
            Self::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
            Self::Binary => None,
        }
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn decode_utf8(bytes: &[u8]) -> Option<String> {
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(text.to_string()),
        // error_len() is None only for an incomplete trailing sequence
        Err(e) if e.error_len().is_none() => {
            std::str::from_utf8(&bytes[..e.valid_up_to()]).ok().map(str::to_string)
        }
        Err(_) => None,
    }
}

fn decode_utf16le(bytes: &[u8]) -> Option<String> {
    let (body, has_bom) = match bytes.strip_prefix(UTF16LE_BOM) {
        Some(rest) => (rest, true),
        None => (bytes, false),
    };

    // Without a BOM, require the zero high bytes typical of mostly-ASCII text
    if !has_bom {
        let high_bytes = body.iter().skip(1).step_by(2);
        let total = high_bytes.clone().count();
        let zeros = high_bytes.filter(|&&b| b == 0).count();
        if total == 0 || zeros * 2 < total {
            return None;
        }
    }

    let even = &body[..body.len() - body.len() % 2];
    let units: Vec<u16> = even
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    let mut text = String::with_capacity(units.len());
    let mut decoded = char::decode_utf16(units.iter().copied()).peekable();
    while let Some(unit) = decoded.next() {
        match unit {
            Ok(c) => text.push(c),
            // A high surrogate cut off by the buffer end
            Err(_) if decoded.peek().is_none() => break,
            Err(_) => return None,
        }
    }
    Some(text)
}

/// First candidate encoding producing NUL-free text
pub fn decode_auto(bytes: &[u8]) -> Option<(TextEncoding, String)> {
    CANDIDATE_ENCODINGS.iter().find_map(|encoding| {
        encoding
            .decode(bytes)
            .filter(|text| !text.contains('\0'))
            .map(|text| (*encoding, text))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn utf16le(text: &str, bom: bool) -> Vec<u8> {
        let mut out = if bom { UTF16LE_BOM.to_vec() } else { Vec::new() };
        for unit in text.encode_utf16() {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_utf8_strips_bom_and_truncated_tail() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("100,NEM12,é".as_bytes());
        bytes.pop();
        assert_eq!(TextEncoding::Utf8.decode(&bytes).unwrap(), "100,NEM12,");
    }

    #[test]
    fn test_utf8_rejects_invalid_middle() {
        assert!(TextEncoding::Utf8.decode(&[b'a', 0xFF, b'b']).is_none());
    }

    #[test]
    fn test_utf16le_with_and_without_bom() {
        assert_eq!(
            TextEncoding::Utf16Le.decode(&utf16le("100,NEM12", true)).unwrap(),
            "100,NEM12"
        );
        assert_eq!(
            TextEncoding::Utf16Le.decode(&utf16le("100,NEM12", false)).unwrap(),
            "100,NEM12"
        );
    }

    #[test]
    fn test_utf16le_rejects_plain_ascii() {
        assert!(TextEncoding::Utf16Le.decode(b"100,NEM12,2026").is_none());
    }

    #[test]
    fn test_utf16le_drops_odd_trailing_byte() {
        let mut bytes = utf16le("200,N", true);
        bytes.push(b'X');
        assert_eq!(TextEncoding::Utf16Le.decode(&bytes).unwrap(), "200,N");
    }

    #[test]
    fn test_decode_auto_prefers_utf16_over_nul_laden_utf8() {
        let bytes = utf16le("100,NEM12", false);
        let (encoding, text) = decode_auto(&bytes).unwrap();
        assert_eq!(encoding, TextEncoding::Utf16Le);
        assert_eq!(text, "100,NEM12");

        let (encoding, _) = decode_auto(b"Serial_No,kWh").unwrap();
        assert_eq!(encoding, TextEncoding::Utf8);

        let (encoding, text) = decode_auto(&[b'c', 0xE9, b'x']).unwrap();
        assert_eq!(encoding, TextEncoding::Latin1);
        assert_eq!(text, "céx");
    }
}
