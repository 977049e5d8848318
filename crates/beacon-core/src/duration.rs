//! Human-readable duration strings used throughout `beacon.toml`.

use std::time::Duration;

/// Parse a duration string like "500ms", "5s", "2m" or "1h".
///
/// A bare number is read as seconds. Values too large to represent in
/// milliseconds are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let count: u64 = digits.parse().ok()?;

    let unit_ms: u64 = match unit.trim() {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        _ => return None,
    };
    count.checked_mul(unit_ms).map(Duration::from_millis)
}
