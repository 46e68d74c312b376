// Numeric input grammar and human-readable number formatting.
//
// Integers may be decimal, hexadecimal (0x) or octal (leading 0) and
// may carry a multiplier suffix: `s` for sectors, and the SI / binary
// prefixes k, Ki, M, Mi, ... E, Ei. Time intervals are `<n>[.<frac>]`
// followed by an optional unit from s, m, h, d.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

// Display style for format_num, chosen once during CLI parsing
static BINARY_PREFIXES: AtomicBool = AtomicBool::new(false);

pub fn set_binary_prefixes(on: bool) {
    BINARY_PREFIXES.store(on, Ordering::Relaxed);
}

fn binary_prefixes() -> bool {
    BINARY_PREFIXES.load(Ordering::Relaxed)
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum NumError {
    #[error("invalid number '{0}'")]
    Invalid(String),
    #[error("number '{0}' out of range")]
    OutOfRange(String),
}

fn multiplier(suffix: &str, hardbs: u64) -> Option<u64> {
    match suffix {
        "" => Some(1),
        "s" => Some(hardbs),
        "k" => Some(1000),
        "Ki" => Some(1 << 10),
        "M" => Some(1000_u64.pow(2)),
        "Mi" => Some(1 << 20),
        "G" => Some(1000_u64.pow(3)),
        "Gi" => Some(1 << 30),
        "T" => Some(1000_u64.pow(4)),
        "Ti" => Some(1 << 40),
        "P" => Some(1000_u64.pow(5)),
        "Pi" => Some(1 << 50),
        "E" => Some(1000_u64.pow(6)),
        "Ei" => Some(1 << 60),
        _ => None,
    }
}

/// Parse a number with an optional multiplier suffix. `hardbs` gives
/// the value of the `s` (sectors) suffix.
pub fn parse_num(arg: &str, hardbs: u64) -> Result<u64, NumError> {
    let arg = arg.trim();
    // like strtoll: the base decides which characters belong to the
    // number, the rest is the multiplier suffix
    let digit_len = if arg.starts_with("0x") || arg.starts_with("0X") {
        2 + arg[2..]
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(arg.len() - 2)
    } else {
        arg.find(|c: char| !c.is_ascii_digit()).unwrap_or(arg.len())
    };
    let (digits, suffix) = arg.split_at(digit_len);
    if digits.is_empty() || digits == "0x" || digits == "0X" {
        return Err(NumError::Invalid(arg.to_string()));
    }
    let base = crate::mapfile::codec::parse_c_u64(digits)
        .ok_or_else(|| NumError::Invalid(arg.to_string()))?;
    let mult = multiplier(suffix, hardbs).ok_or_else(|| NumError::Invalid(arg.to_string()))?;
    base.checked_mul(mult)
        .ok_or_else(|| NumError::OutOfRange(arg.to_string()))
}

/// Parse a time interval in seconds: `1`, `1.5m`, `2h`, `3d`.
pub fn parse_time_interval(arg: &str) -> Result<Duration, NumError> {
    let arg = arg.trim();
    let (number, unit) = match arg.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(i) => arg.split_at(i),
        None => (arg, ""),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| NumError::Invalid(arg.to_string()))?;
    let scale = match unit {
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        _ => return Err(NumError::Invalid(arg.to_string())),
    };
    if !value.is_finite() || value < 0.0 {
        return Err(NumError::Invalid(arg.to_string()));
    }
    Ok(Duration::from_secs_f64(value * scale))
}

/// Format a byte count with the prefix style selected at startup
pub fn format_num(n: u64) -> String {
    let (step, units): (u64, &[&str]) = if binary_prefixes() {
        (1024, &["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"])
    } else {
        (1000, &["", "k", "M", "G", "T", "P", "E"])
    };
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 9999.5 && unit + 1 < units.len() {
        value /= step as f64;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} ")
    } else {
        format!("{value:.0} {}", units[unit])
    }
}

/// Fraction shown as a percentage with two decimals
pub fn format_percentage(num: u64, den: u64) -> String {
    if den == 0 {
        return if num > 0 { "+INF%".to_string() } else { "NAN%".to_string() };
    }
    format!("{:.2}%", num as f64 * 100.0 / den as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_numbers() {
        assert_eq!(parse_num("0", 512), Ok(0));
        assert_eq!(parse_num("4096", 512), Ok(4096));
        assert_eq!(parse_num("0x1000", 512), Ok(4096));
        assert_eq!(parse_num("010", 512), Ok(8));
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(parse_num("2s", 512), Ok(1024));
        assert_eq!(parse_num("1k", 512), Ok(1000));
        assert_eq!(parse_num("1Ki", 512), Ok(1024));
        assert_eq!(parse_num("64Ki", 512), Ok(65536));
        assert_eq!(parse_num("1M", 512), Ok(1_000_000));
        assert_eq!(parse_num("1Mi", 512), Ok(1 << 20));
        assert_eq!(parse_num("1Gi", 512), Ok(1 << 30));
        assert_eq!(parse_num("1E", 512), Ok(1000_u64.pow(6)));
        assert_eq!(parse_num("1Ei", 512), Ok(1 << 60));
    }

    #[test]
    fn test_hex_with_suffix() {
        assert_eq!(parse_num("0x10Ki", 512), Ok(16 * 1024));
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(parse_num("", 512).is_err());
        assert!(parse_num("12q", 512).is_err());
        assert!(parse_num("Ki", 512).is_err());
        assert!(matches!(
            parse_num("0xFFFFFFFFFFFFFFFFKi", 512),
            Err(NumError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_time_intervals() {
        assert_eq!(parse_time_interval("30"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_time_interval("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_time_interval("1.5m"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_time_interval("2h"), Ok(Duration::from_secs(7200)));
        assert_eq!(parse_time_interval("1d"), Ok(Duration::from_secs(86400)));
        assert!(parse_time_interval("5w").is_err());
    }

    #[test]
    fn test_format_percentage() {
        assert_eq!(format_percentage(1, 2), "50.00%");
        assert_eq!(format_percentage(0, 0), "NAN%");
        assert_eq!(format_percentage(1, 0), "+INF%");
    }
}
