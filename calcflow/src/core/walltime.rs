//! Scheduler walltime requests.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::errors::ConfigError;

/// A walltime request, stored in whole seconds.
///
/// Parses `HH:MM:SS`, `MM:SS` and `D-HH:MM:SS`; always renders as
/// `HH:MM:SS` with hours allowed past 24.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Walltime {
    seconds: u64,
}

impl Walltime {
    /// Creates a walltime from seconds.
    #[must_use]
    pub const fn from_seconds(seconds: u64) -> Self {
        Self { seconds }
    }

    /// Creates a walltime from hours.
    #[must_use]
    pub const fn from_hours(hours: u64) -> Self {
        Self {
            seconds: hours * 3600,
        }
    }

    /// Total seconds requested.
    #[must_use]
    pub const fn as_seconds(self) -> u64 {
        self.seconds
    }

    /// Twice this walltime, never above `ceiling`.
    #[must_use]
    pub fn doubled(self, ceiling: Self) -> Self {
        Self {
            seconds: self.seconds.saturating_mul(2).min(ceiling.seconds),
        }
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.seconds / 3600;
        let minutes = (self.seconds % 3600) / 60;
        let seconds = self.seconds % 60;
        write!(f, "{hours:02}:{minutes:02}:{seconds:02}")
    }
}

impl FromStr for Walltime {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::new(format!("Invalid walltime '{s}'"));
        let (days, clock) = match s.trim().split_once('-') {
            Some((d, rest)) => (d.parse::<u64>().map_err(|_| invalid())?, rest),
            None => (0, s.trim()),
        };

        let fields = clock
            .split(':')
            .map(str::parse::<u64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;
        let (hours, minutes, seconds) = match fields.as_slice() {
            [h, m, s] => (*h, *m, *s),
            [m, s] => (0, *m, *s),
            _ => return Err(invalid()),
        };
        if minutes >= 60 || seconds >= 60 {
            return Err(invalid());
        }

        let total = days
            .checked_mul(24)
            .and_then(|h| h.checked_add(hours))
            .and_then(|h| h.checked_mul(60))
            .and_then(|m| m.checked_add(minutes))
            .and_then(|m| m.checked_mul(60))
            .and_then(|s| s.checked_add(seconds))
            .ok_or_else(invalid)?;
        if total == 0 {
            return Err(ConfigError::new("Walltime must be positive"));
        }
        Ok(Self::from_seconds(total))
    }
}

impl Serialize for Walltime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Walltime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        assert_eq!("01:30:00".parse::<Walltime>().unwrap().as_seconds(), 5400);
        assert_eq!("45:00".parse::<Walltime>().unwrap().as_seconds(), 2700);
        assert_eq!("2-00:00:00".parse::<Walltime>().unwrap().as_seconds(), 172_800);
        assert!("1:75:00".parse::<Walltime>().is_err());
        assert!("soon".parse::<Walltime>().is_err());
        assert!("00:00:00".parse::<Walltime>().is_err());
    }

    #[test]
    fn test_huge_values_are_rejected() {
        assert!("99999999999999999-00:00:00".parse::<Walltime>().is_err());
        assert!(format!("{}:00:00", u64::MAX / 60).parse::<Walltime>().is_err());
        assert!(format!("{}:00", u64::MAX).parse::<Walltime>().is_err());
    }

    #[test]
    fn test_display_past_one_day() {
        assert_eq!(Walltime::from_hours(30).to_string(), "30:00:00");
        assert_eq!(Walltime::from_seconds(3725).to_string(), "01:02:05");
    }

    #[test]
    fn test_doubling_stops_at_ceiling() {
        let ceiling = Walltime::from_hours(48);
        let mut walltime = Walltime::from_hours(10);
        let mut seen = vec![];
        for _ in 0..4 {
            walltime = walltime.doubled(ceiling);
            seen.push(walltime.as_seconds() / 3600);
        }
        assert_eq!(seen, vec![20, 40, 48, 48]);
    }

    #[test]
    fn test_serde_as_string() {
        let walltime: Walltime = serde_json::from_str("\"04:00:00\"").unwrap();
        assert_eq!(walltime, Walltime::from_hours(4));
        assert_eq!(serde_json::to_string(&walltime).unwrap(), "\"04:00:00\"");
    }
}
