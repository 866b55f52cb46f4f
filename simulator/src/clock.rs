use chrono::{DateTime, TimeZone, Utc};

/// Source of wall-clock time for the fleet.
pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;

    /// Current time as fractional seconds since the Unix epoch.
    fn epoch_seconds(&self) -> f64 {
        to_epoch_seconds(self.now())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub fn to_epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// `None` when `seconds` falls outside the range chrono can represent.
pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round() as i64;
    Utc.timestamp_micros(micros).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_seconds_keep_microseconds() {
        let at = Utc.timestamp_micros(1_700_000_000_123_456).unwrap();
        let seconds = to_epoch_seconds(at);
        assert!((seconds - 1_700_000_000.123456).abs() < 1e-6);
        assert_eq!(from_epoch_seconds(seconds), Some(at));
    }

    #[test]
    fn test_out_of_range_seconds_are_none() {
        assert_eq!(from_epoch_seconds(1e20), None);
        assert_eq!(from_epoch_seconds(-1e20), None);
        assert_eq!(from_epoch_seconds(f64::NAN), None);
    }
}
