//! Human-readable duration strings (`"30s"`, `"1m"`, `"1h30m"`, `"1.5s"`, `"250ms"`).
//!
//! Timeouts in the configuration are written as a sequence of decimal numbers,
//! each followed by a unit: `ns`, `us` (or `µs`), `ms`, `s`, `m`, `h`. The
//! parser is lenient by contract: anything it cannot understand yields `None`,
//! which callers treat as "no explicit timeout".

use std::time::Duration;

/// Parses a timeout string.
///
/// Returns `None` for empty, malformed or negative input. A literal `"0"` is
/// accepted and yields a zero duration; callers decide whether zero means
/// "unset".
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use gantry_core::duration::parse_timeout;
///
/// assert_eq!(parse_timeout("30s"), Some(Duration::from_secs(30)));
/// assert_eq!(parse_timeout("1h30m"), Some(Duration::from_secs(5400)));
/// assert_eq!(parse_timeout("soon"), None);
/// ```
#[must_use]
pub fn parse_timeout(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() || s.starts_with('-') {
        return None;
    }
    let s = s.strip_prefix('+').unwrap_or(s);
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = unit_nanos(&rest[..unit_len])?;
        rest = &rest[unit_len..];

        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(Duration::from_nanos(total_nanos.round() as u64))
}

/// Parses a timeout and discards zero, so callers only see positive windows.
#[must_use]
pub fn parse_positive_timeout(input: &str) -> Option<Duration> {
    parse_timeout(input).filter(|d| !d.is_zero())
}

fn unit_nanos(unit: &str) -> Option<f64> {
    let scale = match unit {
        "ns" => 1.0,
        "us" | "µs" | "μs" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        _ => return None,
    };
    Some(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_timeout("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_timeout("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_timeout("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_timeout("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_timeout("10us"), Some(Duration::from_micros(10)));
        assert_eq!(parse_timeout("7ns"), Some(Duration::from_nanos(7)));
    }

    #[test]
    fn parses_compound_and_fractional() {
        assert_eq!(parse_timeout("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_timeout("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_timeout("1m0.5s"), Some(Duration::from_millis(60_500)));
    }

    #[test]
    fn zero_is_accepted_but_not_positive() {
        assert_eq!(parse_timeout("0"), Some(Duration::ZERO));
        assert_eq!(parse_timeout("0s"), Some(Duration::ZERO));
        assert_eq!(parse_positive_timeout("0s"), None);
        assert_eq!(
            parse_positive_timeout("3s"),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "   ", "10", "s", "ten seconds", "5x", "-1s", "1..5s", "1s-"] {
            assert_eq!(parse_timeout(bad), None, "input {bad:?}");
        }
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(parse_timeout(" 5s "), Some(Duration::from_secs(5)));
    }
}
