//! Validators and parsing helpers (C2).
//!
//! All user-provided values that end up in labels, shell commands, or
//! runtime API calls are validated here first; nothing downstream should
//! need to re-check them.

use crate::error::SandboxError;
use chrono::{DateTime, TimeZone, Utc};

/// Maximum label key length, following the DNS-1123 + `/` segment rule.
const MAX_LABEL_KEY_LEN: usize = 253;

/// `ensure_entrypoint`: non-empty sequence of non-empty strings.
pub fn ensure_entrypoint(entrypoint: &[String]) -> Result<(), SandboxError> {
    if entrypoint.is_empty() || entrypoint.iter().any(|s| s.is_empty()) {
        return Err(SandboxError::InvalidEntrypoint);
    }
    Ok(())
}

/// Validate a single label key: DNS-1123 segment, optional `prefix/name`.
fn is_valid_label_key(key: &str) -> bool {
    if key.is_empty() || key.len() > MAX_LABEL_KEY_LEN || key.contains(' ') {
        return false;
    }

    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty() || !is_valid_dns_subdomain(prefix) {
                return false;
            }
            name
        }
        None => key,
    };

    is_valid_dns1123_name(name)
}

fn is_valid_dns_subdomain(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_valid_dns1123_name)
}

fn is_valid_dns1123_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let chars: Vec<char> = name.chars().collect();
    let first_ok = chars[0].is_ascii_alphanumeric();
    let last_ok = chars[chars.len() - 1].is_ascii_alphanumeric();
    let body_ok = chars
        .iter()
        .all(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_');
    first_ok && last_ok && body_ok
}

/// `ensure_metadata_labels`: each key matches the label key rule, values are
/// non-empty after trimming.
pub fn ensure_metadata_labels(
    metadata: &std::collections::HashMap<String, String>,
) -> Result<(), SandboxError> {
    for (key, value) in metadata {
        if key.starts_with(crate::labels::RESERVED_PREFIX) {
            return Err(SandboxError::InvalidMetadataLabel(key.clone()));
        }
        if !is_valid_label_key(key) {
            return Err(SandboxError::InvalidMetadataLabel(key.clone()));
        }
        if value.trim().is_empty() {
            return Err(SandboxError::InvalidMetadataLabel(key.clone()));
        }
    }
    Ok(())
}

/// `ensure_future_expiration`: coerces naive timestamps to UTC, rejects `t <= now`.
pub fn ensure_future_expiration(
    t: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, SandboxError> {
    if t <= now {
        return Err(SandboxError::InvalidExpiration);
    }
    Ok(t)
}

/// `timeout_seconds` must fall in [60, 86400].
pub fn ensure_timeout_seconds(seconds: i64) -> Result<(), SandboxError> {
    if !(60..=86400).contains(&seconds) {
        return Err(SandboxError::InvalidParameter(format!(
            "timeoutSeconds must be in [60, 86400], got {seconds}"
        )));
    }
    Ok(())
}

/// `page_size` must fall in [1, 200].
pub fn ensure_page_size(page_size: u32) -> Result<(), SandboxError> {
    if !(1..=200).contains(&page_size) {
        return Err(SandboxError::InvalidParameter(format!(
            "pageSize must be in [1, 200], got {page_size}"
        )));
    }
    Ok(())
}

/// `parse_memory_limit`: accepts `B, K, Ki, M, Mi, G, Gi` (case-insensitive);
/// decimal suffixes are powers of 1000, binary (`i`) suffixes powers of 1024.
pub fn parse_memory_limit(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let lower = s.to_lowercase();
    let (digits, multiplier): (&str, i64) = if let Some(d) = lower.strip_suffix("ki") {
        (d, 1024)
    } else if let Some(d) = lower.strip_suffix("mi") {
        (d, 1024 * 1024)
    } else if let Some(d) = lower.strip_suffix("gi") {
        (d, 1024 * 1024 * 1024)
    } else if let Some(d) = lower.strip_suffix('k') {
        (d, 1000)
    } else if let Some(d) = lower.strip_suffix('m') {
        (d, 1_000_000)
    } else if let Some(d) = lower.strip_suffix('g') {
        (d, 1_000_000_000)
    } else if let Some(d) = lower.strip_suffix('b') {
        (d, 1)
    } else {
        (lower.as_str(), 1)
    };

    let value: f64 = digits.trim().parse().ok()?;
    if value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as i64)
}

/// `parse_nano_cpus`: `"500m"` -> 5e8, `"2"` -> 2e9.
pub fn parse_nano_cpus(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(milli) = s.strip_suffix('m') {
        let value: f64 = milli.trim().parse().ok()?;
        if value < 0.0 {
            return None;
        }
        Some((value * 1_000_000.0) as i64)
    } else {
        let value: f64 = s.parse().ok()?;
        if value < 0.0 {
            return None;
        }
        Some((value * 1_000_000_000.0) as i64)
    }
}

/// Well-known epoch returned for unparseable or sentinel timestamps.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(0, 0).unwrap()
}

/// `parse_timestamp`: RFC-3339; sentinel `0001-01-01T00:00:00Z` and any
/// unparseable input fall back to [`epoch`] rather than raising.
pub fn parse_timestamp(s: &str) -> DateTime<Utc> {
    if s == "0001-01-01T00:00:00Z" {
        return epoch();
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| epoch())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn entrypoint_rejects_empty() {
        assert!(ensure_entrypoint(&[]).is_err());
        assert!(ensure_entrypoint(&["".to_string()]).is_err());
        assert!(ensure_entrypoint(&["python".to_string()]).is_ok());
    }

    #[test]
    fn metadata_rejects_reserved_prefix() {
        let mut m = HashMap::new();
        m.insert("opensandbox.io/id".to_string(), "x".to_string());
        assert!(ensure_metadata_labels(&m).is_err());
    }

    #[test]
    fn metadata_rejects_bad_key_and_empty_value() {
        let mut m = HashMap::new();
        m.insert("has space".to_string(), "v".to_string());
        assert!(ensure_metadata_labels(&m).is_err());

        let mut m2 = HashMap::new();
        m2.insert("project".to_string(), "   ".to_string());
        assert!(ensure_metadata_labels(&m2).is_err());

        let mut m3 = HashMap::new();
        m3.insert("team/project".to_string(), "t".to_string());
        assert!(ensure_metadata_labels(&m3).is_ok());
    }

    #[test]
    fn memory_limit_decimal_and_binary() {
        assert_eq!(parse_memory_limit("512Mi"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1G"), Some(1_000_000_000));
        assert_eq!(parse_memory_limit("bogus"), None);
    }

    #[test]
    fn nano_cpus_millis_and_whole() {
        assert_eq!(parse_nano_cpus("500m"), Some(500_000_000));
        assert_eq!(parse_nano_cpus("2"), Some(2_000_000_000));
        assert_eq!(parse_nano_cpus("nope"), None);
    }

    #[test]
    fn timestamp_falls_back_to_epoch_on_sentinel_or_garbage() {
        assert_eq!(parse_timestamp("0001-01-01T00:00:00Z"), epoch());
        assert_eq!(parse_timestamp("not a date"), epoch());
        let parsed = parse_timestamp("2026-01-01T00:00:00Z");
        assert_eq!(parsed.timestamp(), 1767225600);
    }

    #[test]
    fn timeout_boundaries() {
        assert!(ensure_timeout_seconds(60).is_ok());
        assert!(ensure_timeout_seconds(86400).is_ok());
        assert!(ensure_timeout_seconds(59).is_err());
        assert!(ensure_timeout_seconds(86401).is_err());
    }

    #[test]
    fn page_size_boundaries() {
        assert!(ensure_page_size(1).is_ok());
        assert!(ensure_page_size(200).is_ok());
        assert!(ensure_page_size(0).is_err());
        assert!(ensure_page_size(201).is_err());
    }
}
