//! Human-readable `Duration` serialization (`"1500ms"`, `"30s"`, `"10m"`).
//!
//! Used with `#[serde(with = "mender_types::duration_serde")]` on report and
//! configuration fields.

use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Same encoding for optional fields; `None` is skipped or `null`.
pub mod option {
    use super::*;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Parse `<n>ms`, `<n>s`, `<n>m` or `<n>h`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |val: &str| -> Result<u64, String> {
        val.trim()
            .parse()
            .map_err(|e| format!("invalid duration '{}': {}", s, e))
    };
    if let Some(val) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(parse(val)?))
    } else if let Some(val) = s.strip_suffix('s') {
        Ok(Duration::from_secs(parse(val)?))
    } else if let Some(val) = s.strip_suffix('m') {
        scaled(parse(val)?, 60)
    } else if let Some(val) = s.strip_suffix('h') {
        scaled(parse(val)?, 3600)
    } else {
        Err(format!("unknown duration format: {}", s))
    }
}

fn scaled(value: u64, unit_secs: u64) -> Result<Duration, String> {
    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration {value} x {unit_secs}s is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn rejects_unknown_suffix() {
        let err = parse_duration("5d").unwrap_err();
        assert!(err.contains("unknown duration format"));
        let err = parse_duration("xs").unwrap_err();
        assert!(err.contains("invalid duration"));
    }

    #[test]
    fn huge_values_are_errors_not_overflow() {
        let err = parse_duration(&format!("{}h", u64::MAX)).unwrap_err();
        assert!(err.contains("out of range"));
        assert!(parse_duration(&format!("{}m", u64::MAX / 60 + 1)).is_err());
        assert_eq!(
            parse_duration(&format!("{}m", u64::MAX / 60)).unwrap(),
            Duration::from_secs(u64::MAX / 60 * 60)
        );
    }
}
