//! Duration helpers shared by configuration, request params and `$vu.sleep`.

use std::time::Duration;

/// Parse a duration string such as "30s", "500ms", "1.5m" or "1h".
///
/// A bare number is read as milliseconds. Returns `None` for anything else.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (number, scale) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 0.001)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1.0)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60.0)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600.0)
    } else {
        return s.parse::<u64>().ok().map(Duration::from_millis);
    };
    let value = number.trim().parse::<f64>().ok()?;
    secs_to_duration(value * scale)
}

/// Like [`parse_duration_str`], but falls back to `default` and logs a warning.
pub fn parse_duration_or_warn(s: &str, default: Duration, context: &str) -> Duration {
    match parse_duration_str(s) {
        Some(d) => d,
        None => {
            tracing::warn!(
                value = s,
                context,
                default_ms = default.as_millis() as u64,
                "invalid duration, using default"
            );
            default
        }
    }
}

/// Convert fractional seconds to a `Duration`. Negative, NaN, infinite and
/// out-of-range inputs yield `None`.
pub fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}
