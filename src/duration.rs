//! Parsing and formatting of human-readable duration strings.

use std::time::Duration;

use anyhow::{bail, Result};

/// Suffix to seconds multiplier (order matters: longer suffixes first)
const UNITS: &[(&str, f64)] = &[
    ("ms", 0.001),
    ("h", 3600.0),
    ("m", 60.0),
    ("s", 1.0),
];

/// Parse duration strings like "10s", "1m", "1.5h", "250ms"
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    for (suffix, multiplier) in UNITS {
        if let Some(val_str) = s.strip_suffix(suffix) {
            let val: f64 = val_str.trim().parse()?;
            if val < 0.0 {
                bail!("Negative duration: {}", s);
            }
            return Ok(Duration::from_secs_f64(val * multiplier));
        }
    }

    bail!("Unknown duration format: {}", s)
}

/// Format a duration for display
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs >= 3600.0 {
        format!("{:.1}h", secs / 3600.0)
    } else if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else if secs >= 1.0 {
        format!("{:.0}s", secs)
    } else {
        format!("{:.0}ms", secs * 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seconds() {
        let d = parse_duration("10s").unwrap();
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_minutes() {
        let d = parse_duration("1m").unwrap();
        assert_eq!(d, Duration::from_secs(60));
    }

    #[test]
    fn test_parse_fractional_hours() {
        let d = parse_duration("1.5h").unwrap();
        assert_eq!(d, Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_milliseconds() {
        let d = parse_duration("250ms").unwrap();
        assert_eq!(d, Duration::from_millis(250));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_format_roundtrip_shapes() {
        assert_eq!(format_duration(Duration::from_secs(10)), "10s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1.0m");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1.5h");
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    }
}
