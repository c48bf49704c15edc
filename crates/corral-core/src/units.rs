//! Parsing of human-readable sizes and rates (`512MB`, `1GiB`, `100Mbit`).

use corral_common::error::{CorralError, Result};

const DECIMAL: [(&str, u64); 6] = [
    ("kB", 1_000),
    ("KB", 1_000),
    ("MB", 1_000_000),
    ("GB", 1_000_000_000),
    ("TB", 1_000_000_000_000),
    ("PB", 1_000_000_000_000_000),
];

const BINARY: [(&str, u64); 5] = [
    ("KiB", 1 << 10),
    ("MiB", 1 << 20),
    ("GiB", 1 << 30),
    ("TiB", 1 << 40),
    ("PiB", 1 << 50),
];

fn split_number(value: &str) -> (&str, &str) {
    let idx = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value.split_at(idx)
}

/// Parses a byte size such as `10GB`, `512MiB` or `4096B` (a bare number is bytes).
///
/// # Errors
///
/// Returns a validation error for unknown suffixes or malformed numbers.
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let (number, suffix) = split_number(value);
    let invalid = || CorralError::validation(format!("invalid size: {value:?}"));
    let number: u64 = number.parse().map_err(|_| invalid())?;
    let multiplier = match suffix {
        "" | "B" => 1,
        s => DECIMAL
            .iter()
            .chain(BINARY.iter())
            .find(|(name, _)| *name == s)
            .map(|(_, m)| *m)
            .ok_or_else(invalid)?,
    };
    number.checked_mul(multiplier).ok_or_else(invalid)
}

/// Parses a bit rate such as `100Mbit` or `1Gbit` into bits per second.
///
/// # Errors
///
/// Returns a validation error for unknown suffixes or malformed numbers.
pub fn parse_bit_rate(value: &str) -> Result<u64> {
    let value = value.trim();
    let (number, suffix) = split_number(value);
    let invalid = || CorralError::validation(format!("invalid rate: {value:?}"));
    let number: u64 = number.parse().map_err(|_| invalid())?;
    let multiplier: u64 = match suffix {
        "bit" | "" => 1,
        "kbit" => 1_000,
        "Mbit" => 1_000_000,
        "Gbit" => 1_000_000_000,
        "Tbit" => 1_000_000_000_000,
        _ => return Err(invalid()),
    };
    number.checked_mul(multiplier).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes() {
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size("10MB").unwrap(), 10_000_000);
        assert_eq!(parse_byte_size("1GiB").unwrap(), 1 << 30);
        assert_eq!(parse_byte_size(" 2kB ").unwrap(), 2000);
        assert!(parse_byte_size("ten").is_err());
        assert!(parse_byte_size("10XB").is_err());
    }

    #[test]
    fn bit_rates() {
        assert_eq!(parse_bit_rate("100Mbit").unwrap(), 100_000_000);
        assert_eq!(parse_bit_rate("1Gbit").unwrap(), 1_000_000_000);
        assert!(parse_bit_rate("1GB").is_err());
    }
}
