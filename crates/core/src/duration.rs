//! Duration tokens for the subscription protocol (`xs:duration` subset).
//!
//! Timeouts, termination times and renew extensions travel as compact
//! tokens of the form:
//!
//! ```text
//! PT[nH][nM][nS]
//! ```
//!
//! | Duration | Token |
//! |----------|-------|
//! | 0 | `PT0S` |
//! | 10 s | `PT10S` |
//! | 1 h | `PT1H` |
//! | 1 h 30 s | `PT1H30S` |
//!
//! [`format`] omits zero-valued components, so every token it produces
//! parses back to the same token. [`parse`] also accepts fractional seconds
//! (`PT0.5S`), which some devices emit in `PullMessages` responses.

use std::time::Duration;

use crate::error::{DurationErrorKind, Error, Result};

const SECS_PER_HOUR: u64 = 3600;
const SECS_PER_MINUTE: u64 = 60;

/// Encode a duration as a `PT[nH][nM][nS]` token.
///
/// Sub-second precision is truncated; the wire format carries whole seconds.
///
/// ```
/// use std::time::Duration;
///
/// assert_eq!(onvif::duration::format(Duration::ZERO), "PT0S");
/// assert_eq!(onvif::duration::format(Duration::from_secs(3630)), "PT1H30S");
/// ```
pub fn format(duration: Duration) -> String {
    let total = duration.as_secs();
    if total == 0 {
        return "PT0S".to_string();
    }

    let hours = total / SECS_PER_HOUR;
    let minutes = (total % SECS_PER_HOUR) / SECS_PER_MINUTE;
    let seconds = total % SECS_PER_MINUTE;

    let mut token = String::from("PT");
    if hours > 0 {
        token.push_str(&format!("{hours}H"));
    }
    if minutes > 0 {
        token.push_str(&format!("{minutes}M"));
    }
    if seconds > 0 {
        token.push_str(&format!("{seconds}S"));
    }
    token
}

/// Decode a `PT[nH][nM][nS]` token.
///
/// Components must appear in `H`, `M`, `S` order, at most once each, with
/// non-negative decimal values. Returns [`Error::InvalidDuration`] otherwise.
///
/// ```
/// use std::time::Duration;
///
/// assert_eq!(onvif::duration::parse("PT1M").unwrap(), Duration::from_secs(60));
/// assert!(onvif::duration::parse("PT-5S").is_err());
/// ```
pub fn parse(token: &str) -> Result<Duration> {
    let fail = |kind| Error::InvalidDuration {
        token: token.to_string(),
        kind,
    };

    if token.is_empty() {
        return Err(fail(DurationErrorKind::Empty));
    }
    if token.starts_with('-') {
        return Err(fail(DurationErrorKind::Negative));
    }

    let mut rest = token
        .strip_prefix("PT")
        .ok_or(fail(DurationErrorKind::MissingPrefix))?;
    if rest.is_empty() {
        return Err(fail(DurationErrorKind::NoComponents));
    }

    let mut total = Duration::ZERO;
    let mut last_rank = 0;

    while !rest.is_empty() {
        let end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or(fail(DurationErrorKind::UnknownDesignator))?;
        let (number, tail) = rest.split_at(end);
        let designator = tail.chars().next().unwrap_or_default();

        if number.is_empty() {
            return Err(fail(if designator == '-' {
                DurationErrorKind::Negative
            } else {
                DurationErrorKind::NotNumeric
            }));
        }

        let (rank, unit_secs) = match designator {
            'H' => (1, SECS_PER_HOUR),
            'M' => (2, SECS_PER_MINUTE),
            'S' => (3, 1),
            _ => return Err(fail(DurationErrorKind::UnknownDesignator)),
        };
        if rank <= last_rank {
            return Err(fail(DurationErrorKind::OutOfOrder));
        }
        last_rank = rank;

        let component = if designator == 'S' {
            parse_seconds(number).map_err(fail)?
        } else {
            let value: u64 = number
                .parse()
                .map_err(|_| fail(DurationErrorKind::NotNumeric))?;
            let secs = value
                .checked_mul(unit_secs)
                .ok_or(fail(DurationErrorKind::Overflow))?;
            Duration::from_secs(secs)
        };

        total = total
            .checked_add(component)
            .ok_or(fail(DurationErrorKind::Overflow))?;
        rest = &tail[designator.len_utf8()..];
    }

    Ok(total)
}

/// Parse `n` or `n.fff` seconds, keeping up to nanosecond precision.
fn parse_seconds(number: &str) -> std::result::Result<Duration, DurationErrorKind> {
    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (number, None),
    };
    if whole.is_empty() {
        return Err(DurationErrorKind::NotNumeric);
    }
    let secs: u64 = whole.parse().map_err(|_| DurationErrorKind::NotNumeric)?;

    let nanos = match fraction {
        None => 0,
        Some(f) if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) => {
            return Err(DurationErrorKind::NotNumeric);
        }
        Some(f) => {
            let digits: String = f.chars().chain(std::iter::repeat('0')).take(9).collect();
            digits.parse::<u32>().map_err(|_| DurationErrorKind::NotNumeric)?
        }
    };

    Ok(Duration::new(secs, nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_zero() {
        assert_eq!(format(Duration::ZERO), "PT0S");
        assert_eq!(format(Duration::from_millis(999)), "PT0S");
    }

    #[test]
    fn format_omits_zero_components() {
        assert_eq!(format(Duration::from_secs(10)), "PT10S");
        assert_eq!(format(Duration::from_secs(60)), "PT1M");
        assert_eq!(format(Duration::from_secs(3600)), "PT1H");
        assert_eq!(format(Duration::from_secs(7200)), "PT2H");
        assert_eq!(format(Duration::from_secs(3630)), "PT1H30S");
        assert_eq!(format(Duration::from_secs(3661)), "PT1H1M1S");
        assert_eq!(format(Duration::from_secs(90 * 3600)), "PT90H");
    }

    #[test]
    fn format_then_parse_is_stable() {
        for hours in [0u64, 1, 2, 23, 24, 100] {
            for minutes in 0..60u64 {
                for seconds in [0u64, 1, 9, 30, 59] {
                    let d = Duration::from_secs(hours * 3600 + minutes * 60 + seconds);
                    let token = format(d);
                    let parsed = parse(&token).unwrap();
                    assert_eq!(parsed, d, "token {token}");
                    assert_eq!(format(parsed), token);
                }
            }
        }
    }

    #[test]
    fn parse_non_canonical_tokens() {
        assert_eq!(parse("PT90M").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse("PT1H0M0S").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("PT0.5S").unwrap(), Duration::from_millis(500));
        assert_eq!(parse("PT1.25S").unwrap(), Duration::from_millis(1250));
    }

    fn kind_of(token: &str) -> DurationErrorKind {
        match parse(token) {
            Err(Error::InvalidDuration { kind, .. }) => kind,
            other => panic!("expected InvalidDuration for {token:?}, got {other:?}"),
        }
    }

    #[test]
    fn parse_rejects_malformed_tokens() {
        assert_eq!(kind_of(""), DurationErrorKind::Empty);
        assert_eq!(kind_of("10S"), DurationErrorKind::MissingPrefix);
        assert_eq!(kind_of("P1D"), DurationErrorKind::MissingPrefix);
        assert_eq!(kind_of("PT"), DurationErrorKind::NoComponents);
        assert_eq!(kind_of("-PT5S"), DurationErrorKind::Negative);
        assert_eq!(kind_of("PT-5S"), DurationErrorKind::Negative);
        assert_eq!(kind_of("PT1H-5M"), DurationErrorKind::Negative);
        assert_eq!(kind_of("PTabcS"), DurationErrorKind::NotNumeric);
        assert_eq!(kind_of("PTS"), DurationErrorKind::NotNumeric);
        assert_eq!(kind_of("PT1.5M"), DurationErrorKind::NotNumeric);
        assert_eq!(kind_of("PT1..5S"), DurationErrorKind::NotNumeric);
        assert_eq!(kind_of("PT5X"), DurationErrorKind::UnknownDesignator);
        assert_eq!(kind_of("PT12"), DurationErrorKind::UnknownDesignator);
        assert_eq!(kind_of("PT5S1H"), DurationErrorKind::OutOfOrder);
        assert_eq!(kind_of("PT1H2H"), DurationErrorKind::OutOfOrder);
        assert_eq!(
            kind_of("PT99999999999999999999H"),
            DurationErrorKind::NotNumeric
        );
        assert_eq!(kind_of("PT9999999999999999H"), DurationErrorKind::Overflow);
    }
}
