pub const ONE_SECOND_MS: i64 = 1_000;
pub const ONE_MINUTE_MS: i64 = 60 * ONE_SECOND_MS;
pub const FIVE_MINUTES_MS: i64 = 5 * ONE_MINUTE_MS;

/// Parses `"250ms"`, `"30s"`, `"5m"`, `"5min"`, `"1h"`, `"1d"` into milliseconds.
/// A bare integer is read as seconds.
pub fn parse_duration_like_ms(value: &str) -> Result<i64, String> {
    let trimmed = value.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return seconds
            .checked_mul(ONE_SECOND_MS)
            .ok_or_else(|| format!("duration out of range: {value}"));
    }

    let (number_part, unit) = if let Some(stripped) = trimmed.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = trimmed.strip_suffix("min") {
        (stripped, "min")
    } else if let Some(stripped) = trimmed.strip_suffix("hour") {
        (stripped, "hour")
    } else if let Some(stripped) = trimmed.strip_suffix("day") {
        (stripped, "day")
    } else {
        trimmed.split_at(trimmed.len().saturating_sub(1))
    };

    let multiplier = match unit {
        "ms" => 1,
        "s" => ONE_SECOND_MS,
        "m" | "min" => ONE_MINUTE_MS,
        "h" | "hour" => 60 * ONE_MINUTE_MS,
        "d" | "day" => 24 * 60 * ONE_MINUTE_MS,
        _ => return Err(format!("unsupported duration unit: {unit}")),
    };

    let number: i64 = number_part
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration: {value}"))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("duration out of range: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration_like_ms("250ms").unwrap(), 250);
        assert_eq!(parse_duration_like_ms("30s").unwrap(), 30_000);
        assert_eq!(parse_duration_like_ms("5m").unwrap(), FIVE_MINUTES_MS);
        assert_eq!(parse_duration_like_ms("5min").unwrap(), FIVE_MINUTES_MS);
        assert_eq!(parse_duration_like_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_like_ms(" 2D ").unwrap(), 172_800_000);
        assert_eq!(parse_duration_like_ms("45").unwrap(), 45_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration_like_ms("").is_err());
        assert!(parse_duration_like_ms("5x").is_err());
        assert!(parse_duration_like_ms("abcm").is_err());
    }

    #[test]
    fn keeps_sign_for_caller_validation() {
        assert_eq!(parse_duration_like_ms("-5s").unwrap(), -5_000);
    }
}
