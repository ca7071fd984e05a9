//! Character-encoding detection for flat-text sources.
//!
//! Sniffing ladder: BOM, then strict UTF-8, then a byte-statistics gate in
//! front of the Windows-1252 fallback (the usual encoding of
//! Excel-exported CSVs). A byte distribution no single-byte text encoding
//! plausibly produces raises `EncodingDetection`.

use encoding_rs::{UTF_16BE, UTF_16LE, WINDOWS_1252};

use crate::error::LoadError;

/// Decode raw file bytes into the loader's owned text buffer.
pub fn decode_bytes(bytes: Vec<u8>) -> Result<String, LoadError> {
    // BOM wins outright.
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return match String::from_utf8(bytes) {
            Ok(s) => Ok(s[3..].to_string()),
            Err(_) => Err(LoadError::EncodingDetection(
                "UTF-8 BOM followed by invalid UTF-8".into(),
            )),
        };
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        let (decoded, _, malformed) = UTF_16LE.decode(&bytes);
        if malformed {
            return Err(LoadError::EncodingDetection(
                "UTF-16LE BOM with malformed payload".into(),
            ));
        }
        return Ok(strip_bom_char(&decoded));
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        let (decoded, _, malformed) = UTF_16BE.decode(&bytes);
        if malformed {
            return Err(LoadError::EncodingDetection(
                "UTF-16BE BOM with malformed payload".into(),
            ));
        }
        return Ok(strip_bom_char(&decoded));
    }

    // Statistical gate before any decoding attempt: NULs and dense control
    // bytes are valid UTF-8 yet never plausible text in any encoding this
    // loader accepts (UTF-16 without a BOM, binary junk).
    let nul = bytes.iter().filter(|&&b| b == 0).count();
    if nul > 0 {
        return Err(LoadError::EncodingDetection(format!(
            "{nul} NUL byte(s); binary or unsupported multi-byte encoding"
        )));
    }
    let controls = bytes
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r'))
        .count();
    if controls * 20 > bytes.len() {
        return Err(LoadError::EncodingDetection(format!(
            "{controls} control byte(s) in {} bytes",
            bytes.len()
        )));
    }

    // Strict UTF-8 next; recover the buffer from the error on failure.
    let bytes = match String::from_utf8(bytes) {
        Ok(s) => return Ok(s),
        Err(e) => e.into_bytes(),
    };

    let (decoded, _, _) = WINDOWS_1252.decode(&bytes);
    Ok(decoded.into_owned())
}

fn strip_bom_char(s: &str) -> String {
    s.strip_prefix('\u{feff}').unwrap_or(s).to_string()
}
