//! Size string parsing and formatting.
//!
//! Every size or quota field in the system goes through this parser, so the
//! accepted grammar is uniform: an integer followed by an optional byte or
//! bit suffix. Decimal suffixes multiply by powers of 1000 (`kB`, `MB`, ...,
//! `EB`), binary suffixes by powers of 1024 (`KiB`, `MiB`, ..., `EiB`). The
//! analogous bit suffixes (`kbit`, `Kibit`, ...) are accepted and converted
//! to bytes. A bare integer is a byte count.

use thiserror::Error;

/// Errors returned by the size parser.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SizeParseError {
    /// The input was empty.
    #[error("Empty size string")]
    Empty,

    /// The numeric part was missing or not a non-negative integer.
    #[error("Invalid number in size string: {0}")]
    InvalidNumber(String),

    /// The suffix was not one of the recognized byte/bit suffixes.
    #[error("Unknown size suffix: {0}")]
    UnknownSuffix(String),

    /// A bit-suffixed value did not resolve to a whole number of bytes.
    #[error("Bit size is not a whole number of bytes: {0}")]
    NotByteAligned(String),

    /// The value overflows a 64-bit byte count.
    #[error("Size value out of range: {0}")]
    OutOfRange(String),
}

const KB: u128 = 1000;
const KIB: u128 = 1024;

/// Look up the multiplier for a byte suffix, in bytes.
fn byte_multiplier(suffix: &str) -> Option<u128> {
    let mult = match suffix {
        "B" => 1,
        "kB" => KB,
        "MB" => KB.pow(2),
        "GB" => KB.pow(3),
        "TB" => KB.pow(4),
        "PB" => KB.pow(5),
        "EB" => KB.pow(6),
        "KiB" => KIB,
        "MiB" => KIB.pow(2),
        "GiB" => KIB.pow(3),
        "TiB" => KIB.pow(4),
        "PiB" => KIB.pow(5),
        "EiB" => KIB.pow(6),
        _ => return None,
    };

    Some(mult)
}

/// Look up the multiplier for a bit suffix, in bits.
fn bit_multiplier(suffix: &str) -> Option<u128> {
    let mult = match suffix {
        "bit" => 1,
        "kbit" => KB,
        "Mbit" => KB.pow(2),
        "Gbit" => KB.pow(3),
        "Tbit" => KB.pow(4),
        "Pbit" => KB.pow(5),
        "Ebit" => KB.pow(6),
        "Kibit" => KIB,
        "Mibit" => KIB.pow(2),
        "Gibit" => KIB.pow(3),
        "Tibit" => KIB.pow(4),
        "Pibit" => KIB.pow(5),
        "Eibit" => KIB.pow(6),
        _ => return None,
    };

    Some(mult)
}

/// Parse a size string into a canonical byte count.
///
/// Accepts `"10GiB"`, `"10 GiB"`, `"500MB"`, `"8Gbit"`, `"1073741824"`, etc.
/// Fractional values are rejected; bit-suffixed values must resolve to a
/// whole number of bytes.
pub fn parse_byte_size(value: &str) -> Result<u64, SizeParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());

    let (number, suffix) = value.split_at(digits_end);
    let suffix = suffix.trim_start();

    let number: u128 = number
        .parse()
        .map_err(|_| SizeParseError::InvalidNumber(value.to_string()))?;

    let bytes = if suffix.is_empty() {
        number
    } else if let Some(mult) = byte_multiplier(suffix) {
        number
            .checked_mul(mult)
            .ok_or_else(|| SizeParseError::OutOfRange(value.to_string()))?
    } else if let Some(mult) = bit_multiplier(suffix) {
        let bits = number
            .checked_mul(mult)
            .ok_or_else(|| SizeParseError::OutOfRange(value.to_string()))?;

        if bits % 8 != 0 {
            return Err(SizeParseError::NotByteAligned(value.to_string()));
        }

        bits / 8
    } else {
        return Err(SizeParseError::UnknownSuffix(suffix.to_string()));
    };

    u64::try_from(bytes).map_err(|_| SizeParseError::OutOfRange(value.to_string()))
}

/// Format a byte count using the largest binary suffix that divides it
/// exactly, falling back to a plain byte count.
///
/// `parse_byte_size(&format_bytes(n)) == Ok(n)` for every `n`.
pub fn format_bytes(bytes: u64) -> String {
    const SUFFIXES: [(&str, u64); 6] = [
        ("EiB", 1 << 60),
        ("PiB", 1 << 50),
        ("TiB", 1 << 40),
        ("GiB", 1 << 30),
        ("MiB", 1 << 20),
        ("KiB", 1 << 10),
    ];

    if bytes > 0 {
        for (suffix, mult) in SUFFIXES {
            if bytes % mult == 0 {
                return format!("{}{}", bytes / mult, suffix);
            }
        }
    }

    format!("{}B", bytes)
}
