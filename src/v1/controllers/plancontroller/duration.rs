//! Parses the Go-style duration strings (`"30s"`, `"-1m"`, `"1h30m"`) used by
//! `spec.postCompleteDelay` and kept on the wire for compatibility with the
//! upstream `metav1.Duration`/`time.ParseDuration` format this CRD was
//! modeled on.

use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DurationError {
    #[error("not a valid duration: {0:?}")]
    Malformed(String),

    #[error("spec.postCompleteDelay is negative")]
    Negative,
}

/// Parses a signed Go-style duration. Returns the magnitude and whether the input was negative.
pub fn parse_signed(input: &str) -> Result<(Duration, bool), DurationError> {
    let trimmed = input.trim();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    if rest.is_empty() {
        return Err(DurationError::Malformed(input.to_string()));
    }

    let mut total = Duration::ZERO;
    let mut chars = rest.char_indices().peekable();
    let mut any_unit_consumed = false;

    while let Some(&(start, c)) = chars.peek() {
        if !c.is_ascii_digit() && c != '.' {
            return Err(DurationError::Malformed(input.to_string()));
        }

        let mut end = start;
        while let Some(&(idx, c)) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                end = idx + c.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        let number: f64 = rest[start..end]
            .parse()
            .map_err(|_| DurationError::Malformed(input.to_string()))?;

        let unit_start = end;
        let mut unit_end = end;
        while let Some(&(idx, c)) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                break;
            }
            unit_end = idx + c.len_utf8();
            chars.next();
        }

        let unit = &rest[unit_start..unit_end];
        let seconds = match unit {
            "ns" => number / 1_000_000_000.0,
            "us" | "\u{b5}s" => number / 1_000_000.0,
            "ms" => number / 1_000.0,
            "s" => number,
            "m" => number * 60.0,
            "h" => number * 3600.0,
            _ => return Err(DurationError::Malformed(input.to_string())),
        };

        total += Duration::from_secs_f64(seconds.max(0.0));
        any_unit_consumed = true;
    }

    if !any_unit_consumed {
        return Err(DurationError::Malformed(input.to_string()));
    }

    Ok((total, negative))
}

/// Parses a duration that must not be negative, per `spec.postCompleteDelay`'s validation rule.
pub fn parse_non_negative(input: &str) -> Result<Duration, DurationError> {
    let (duration, negative) = parse_signed(input)?;
    if negative && duration > Duration::ZERO {
        return Err(DurationError::Negative);
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_simple_seconds() {
        assert_eq!(parse_non_negative("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_parses_compound_duration() {
        assert_eq!(
            parse_non_negative("1h30m").unwrap(),
            Duration::from_secs(3600 + 1800)
        );
    }

    #[test]
    fn test_rejects_negative() {
        assert_eq!(parse_non_negative("-30s"), Err(DurationError::Negative));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_non_negative("potato").is_err());
    }
}
