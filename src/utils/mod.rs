use std::time::Instant;
use tracing::info;

/// A simple wall-clock timer for logging elapsed time.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("⏱  Starting: {}", label);
        Self {
            label,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!(
            "⏱  Finished: {} (took {:.2?})",
            self.label,
            self.start.elapsed()
        );
    }
}

/// Format a large integer with thousands separators.
pub fn fmt_number(n: i64) -> String {
    let s = n.abs().to_string();
    let mut result = String::new();
    for (i, ch) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(ch);
    }
    if n < 0 {
        result.push('-');
    }
    result.chars().rev().collect()
}

/// Env-style boolean: "1", "true", "yes", "on" (any case). Everything else is false.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Floors a positive finite number. Rejects absent, non-numeric, zero and negative input.
/// "12.9" → 12 | "0" → None | "-3" → None | "abc" → None
pub fn parse_positive_int(value: Option<&str>) -> Option<u64> {
    let n: f64 = value?.trim().parse().ok()?;
    if !n.is_finite() || n <= 0.0 {
        return None;
    }
    let floored = n.floor();
    // 0.5 floors to zero, which is not a usable count
    if floored < 1.0 || floored > u64::MAX as f64 {
        return None;
    }
    Some(floored as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_number() {
        assert_eq!(fmt_number(1_234_567), "1,234,567");
        assert_eq!(fmt_number(0), "0");
        assert_eq!(fmt_number(-42_000), "-42,000");
        assert_eq!(fmt_number(999), "999");
    }

    #[test]
    fn test_is_truthy() {
        for v in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(is_truthy(v), "{v:?} should be truthy");
        }
        for v in ["", "0", "false", "no", "off", "2", "enabled"] {
            assert!(!is_truthy(v), "{v:?} should be falsy");
        }
    }

    #[test]
    fn test_parse_positive_int() {
        assert_eq!(parse_positive_int(Some("12")), Some(12));
        assert_eq!(parse_positive_int(Some("12.9")), Some(12));
        assert_eq!(parse_positive_int(Some(" 7 ")), Some(7));
        assert_eq!(parse_positive_int(Some("0")), None);
        assert_eq!(parse_positive_int(Some("-3")), None);
        assert_eq!(parse_positive_int(Some("0.5")), None);
        assert_eq!(parse_positive_int(Some("abc")), None);
        assert_eq!(parse_positive_int(Some("inf")), None);
        assert_eq!(parse_positive_int(Some("NaN")), None);
        assert_eq!(parse_positive_int(None), None);
    }
}
