//! Human-friendly duration values (`"1s"`, `"5m"`, `"0"`) as they appear
//! in a parsed configuration tree, alongside the raw `Duration` the rest
//! of the crate wants to consume.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// A duration that (de)serializes from the short suffixed form used
/// throughout the configuration (`ms`, `s`, `m`, `h`), defaulting to
/// seconds when no suffix is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl ConfigDuration {
    pub fn as_duration(self) -> Duration {
        self.0
    }
}

impl From<Duration> for ConfigDuration {
    fn from(d: Duration) -> Self {
        ConfigDuration(d)
    }
}

fn parse(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Some(digits) = raw.strip_suffix("ms") {
        return digits.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(digits) = raw.strip_suffix('h') {
        return digits.trim().parse().ok().map(Duration::from_secs).map(|d| d * 3600);
    }
    if let Some(digits) = raw.strip_suffix('m') {
        return digits.trim().parse().ok().map(Duration::from_secs).map(|d| d * 60);
    }
    if let Some(digits) = raw.strip_suffix('s') {
        return digits.trim().parse().ok().map(Duration::from_secs);
    }
    raw.parse().ok().map(Duration::from_secs)
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Helper {
            Text(String),
            Millis(u64),
        }

        match Helper::deserialize(deserializer)? {
            Helper::Millis(ms) => Ok(ConfigDuration(Duration::from_millis(ms))),
            Helper::Text(s) => parse(&s)
                .map(ConfigDuration)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {s}"))),
        }
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_forms() {
        assert_eq!(parse("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn bare_number_defaults_to_seconds() {
        assert_eq!(parse("0"), Some(Duration::ZERO));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse("banana"), None);
    }
}
