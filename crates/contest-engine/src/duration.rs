//! Scenario duration strings (`"500ms"`, `"2s"`, `"1m"`) to `std::time::Duration`.

use crate::{EngineError, Result};
use std::time::Duration;

/// Parses a duration string such as `"500ms"`, `"2s"`, `"1m"`, `"1h"`. A bare
/// number with no unit is treated as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(EngineError::InvalidDuration("empty duration".to_string()));
    }

    let split_at = s
        .rfind(|c: char| c.is_ascii_digit())
        .ok_or_else(|| EngineError::InvalidDuration(s.to_string()))?;
    let (num_str, unit) = s.split_at(split_at + 1);

    let num: u64 = num_str
        .parse()
        .map_err(|_| EngineError::InvalidDuration(s.to_string()))?;

    let duration = match unit {
        "" | "s" => Duration::from_secs(num),
        "ms" => Duration::from_millis(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        other => {
            return Err(EngineError::InvalidDuration(format!(
                "unknown duration unit `{other}` in `{s}`"
            )))
        }
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_milliseconds() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn parses_seconds() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn unknown_unit_rejected() {
        assert!(parse_duration("3x").is_err());
    }

    #[test]
    fn empty_rejected() {
        assert!(parse_duration("").is_err());
    }
}
