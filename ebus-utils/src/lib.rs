//! Small helpers shared by the ebus crates.
//!
//! Durations in configuration files are written in a compact human-readable
//! form such as `"5s"`, `"500ms"` or `"1m30s"`:
//!
//! ```
//! let d = ebus_utils::to_duration("1m30s");
//! assert_eq!(d.as_secs(), 90);
//!
//! let d = ebus_utils::to_duration("250ms");
//! assert_eq!(d.as_millis(), 250);
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::{
    de::{self, Deserializer},
    ser::Serializer,
    Deserialize, Serialize,
};

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    parse_duration(&v).map_err(de::Error::custom)
}

/// Serialize Duration back into the compact string form
#[inline]
pub fn serialize_duration<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    format_duration(*d).serialize(s)
}

/// Convert human-readable duration string to Duration
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
///
/// Unknown units and unparsable segments count as zero, and a sum too large
/// for the millisecond counter saturates.
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let ms = segments(&text.trim().to_lowercase())
        .flatten()
        .fold(0u64, |total, part| part.and_then(|ms| total.checked_add(ms)).unwrap_or(u64::MAX));
    Duration::from_millis(ms)
}

/// Strict variant of [`to_duration`]: every segment must be a number followed
/// by a known unit, and overflow is an error.
///
/// A bare number is read as seconds.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty duration".into());
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let mut total = 0u64;
    for part in segments(&trimmed.to_lowercase()) {
        total = part
            .ok_or_else(|| format!("invalid duration {trimmed:?}"))?
            .and_then(|ms| total.checked_add(ms))
            .ok_or_else(|| format!("duration {trimmed:?} is out of range"))?;
    }
    Ok(Duration::from_millis(total))
}

#[inline]
fn unit_millis(unit: &str) -> Option<u64> {
    match unit {
        "ms" => Some(1),
        "s" => Some(1000),
        "m" => Some(60_000),
        "h" => Some(3_600_000),
        "d" => Some(86_400_000),
        _ => None,
    }
}

/// Splits `"1h30m"` into `<number><unit>` segments, each one yielding its
/// length in milliseconds.
///
/// The outer `None` marks a malformed segment, the inner `None` a segment that
/// overflows `u64` milliseconds.
fn segments(text: &str) -> impl Iterator<Item = Option<Option<u64>>> + '_ {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let (number, tail) = rest.split_at(digits);
        let unit_len = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        rest = tail;

        let part = number.trim().parse::<u64>().ok().zip(unit_millis(unit.trim()));
        Some(part.map(|(v, len)| v.checked_mul(len)))
    })
}

/// Render a Duration using the largest exact units, e.g. `90s` -> `"1m30s"`.
pub fn format_duration(d: Duration) -> String {
    let mut ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".into();
    }
    let mut out = String::new();
    for (unit, len) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1000)] {
        if ms >= len {
            out.push_str(&format!("{}{}", ms / len, unit));
            ms %= len;
        }
    }
    if ms > 0 {
        out.push_str(&format!("{ms}ms"));
    }
    out
}
