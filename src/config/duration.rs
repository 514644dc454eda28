//! Duration parsing utilities.
//!
//! This module provides parsing for human-readable duration strings
//! like "5s", "30s", "1m", "500ms", and a serde adapter so config structs
//! can hold plain `Duration` fields.

use std::time::Duration;

/// Parse a duration string like "10s", "30s", "1m", "500ms".
///
/// Supported formats:
/// - `"Nms"` - N milliseconds (e.g., "500ms")
/// - `"Ns"` - N seconds (e.g., "30s")
/// - `"Nm"` - N minutes (e.g., "5m")
/// - `"N"` - N seconds (no suffix, assumes seconds)
///
/// Returns `None` if the string cannot be parsed.
///
/// # Examples
///
/// ```
/// use hostmesh::config::parse_duration_string;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration_string("5s"), Some(Duration::from_secs(5)));
/// assert_eq!(parse_duration_string("500ms"), Some(Duration::from_millis(500)));
/// assert_eq!(parse_duration_string("1m"), Some(Duration::from_secs(60)));
/// assert_eq!(parse_duration_string("30"), Some(Duration::from_secs(30)));
/// ```
pub fn parse_duration_string(s: &str) -> Option<Duration> {
    let s = s.trim();

    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Format a duration in the shortest unit `parse_duration_string` reads back.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 60_000 == 0 && millis > 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

/// Serde adapter: `#[serde(with = "crate::config::duration_str")]`.
pub mod duration_str {
    use super::{format_duration, parse_duration_string};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration_string(&text).ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "invalid duration '{}': expected e.g. \"500ms\", \"30s\" or \"5m\"",
                    text
                ))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration_string("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration_string("30s"), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_parse_duration_minutes() {
        assert_eq!(parse_duration_string("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration_string("5m"), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_parse_duration_milliseconds() {
        assert_eq!(
            parse_duration_string("500ms"),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_parse_duration_minutes_overflow() {
        assert_eq!(parse_duration_string("999999999999999999m"), None);
        assert_eq!(
            parse_duration_string("307445734561825860m"),
            Some(Duration::from_secs(307445734561825860 * 60))
        );
    }

    #[test]
    fn test_parse_duration_no_suffix() {
        assert_eq!(parse_duration_string("10"), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_eq!(parse_duration_string(""), None);
        assert_eq!(parse_duration_string("abc"), None);
        assert_eq!(parse_duration_string("5x"), None);
        assert_eq!(parse_duration_string("-5s"), None);
    }

    #[test]
    fn test_format_reads_back() {
        for d in [
            Duration::from_millis(250),
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_secs(300),
            Duration::ZERO,
        ] {
            assert_eq!(parse_duration_string(&format_duration(d)), Some(d));
        }
    }
}
