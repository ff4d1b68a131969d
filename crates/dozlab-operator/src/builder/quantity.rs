//! Kubernetes quantity parsing for session resources

use thiserror::Error;

const KIB: f64 = 1024.0;

/// Largest accepted memory/storage quantity (1Pi)
const MAX_BYTES: f64 = KIB * KIB * KIB * KIB * KIB;

/// Largest accepted CPU quantity (1000 cores)
const MAX_MILLICORES: i64 = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,
    #[error("invalid quantity: {0}")]
    Invalid(String),
    #[error("quantity must be positive: {0}")]
    NotPositive(String),
    #[error("quantity too large: {0}")]
    TooLarge(String),
}

/// Parse a memory/storage quantity into bytes (e.g. "128Mi", "1.5Gi", "2G", "1024")
pub fn parse_memory(s: &str) -> Result<i64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (number, multiplier) = split_suffix(s)?;
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::Invalid(s.to_string()))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(QuantityError::NotPositive(s.to_string()));
    }

    let bytes = (value * multiplier).ceil();
    if bytes > MAX_BYTES {
        return Err(QuantityError::TooLarge(s.to_string()));
    }
    Ok(bytes as i64)
}

fn split_suffix(s: &str) -> Result<(&str, f64), QuantityError> {
    // Binary suffixes first so "Mi" is not read as "M"
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", KIB),
        ("Mi", KIB * KIB),
        ("Gi", KIB * KIB * KIB),
        ("Ti", KIB * KIB * KIB * KIB),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];

    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = s.strip_suffix(suffix) {
            return Ok((number, *multiplier));
        }
    }

    if s.ends_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(QuantityError::Invalid(s.to_string()));
    }
    Ok((s, 1.0))
}

/// Parse a CPU quantity into millicores (e.g. "2", "0.5", "500m")
pub fn parse_cpu(s: &str) -> Result<i64, QuantityError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityError::Empty);
    }

    let millicores = if let Some(m) = s.strip_suffix('m') {
        m.parse::<i64>()
            .map_err(|_| QuantityError::Invalid(s.to_string()))?
    } else {
        let cores: f64 = s
            .parse()
            .map_err(|_| QuantityError::Invalid(s.to_string()))?;
        if !cores.is_finite() {
            return Err(QuantityError::Invalid(s.to_string()));
        }
        if cores * 1000.0 > MAX_MILLICORES as f64 {
            return Err(QuantityError::TooLarge(s.to_string()));
        }
        (cores * 1000.0).round() as i64
    };

    if millicores <= 0 {
        return Err(QuantityError::NotPositive(s.to_string()));
    }
    if millicores > MAX_MILLICORES {
        return Err(QuantityError::TooLarge(s.to_string()));
    }
    Ok(millicores)
}

/// Render bytes as a whole-mebibyte quantity, rounding up
pub fn format_mebibytes(bytes: i64) -> String {
    format!("{}Mi", to_mebibytes(bytes))
}

pub fn to_mebibytes(bytes: i64) -> i64 {
    const MIB: i64 = 1024 * 1024;
    bytes.saturating_add(MIB - 1) / MIB
}

pub fn format_millicores(millicores: i64) -> String {
    format!("{millicores}m")
}

/// Whole guest vCPUs for a millicore allowance (at least one)
pub fn to_vcpus(millicores: i64) -> i64 {
    (millicores / 1000).max(1)
}
