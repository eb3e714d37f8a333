//! Unix timestamps and the wall-clock capability.
//!
//! All windows in the core (session expiry, daily rollover, authorization
//! validity, token lifetime) are expressed in whole seconds since the Unix
//! epoch. Timestamps are serialized as stringified integers to avoid loss of
//! precision in JSON.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Seconds in one day, the rolling spend window.
pub const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// A Unix timestamp represented as a `u64`.
///
/// Used in session policies, ledger windows and time-bounded ERC-3009
/// `transferWithAuthorization` messages. Serialized as a stringified integer:
/// `1699999999` becomes `"1699999999"` in the wire format.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct UnixTimestamp(u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>().map(UnixTimestamp).map_err(|_| {
            serde::de::Error::custom(format!("expected stringified Unix seconds, got {s:?}"))
        })
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_add(rhs))
    }
}

impl Sub<u64> for UnixTimestamp {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_sub(rhs))
    }
}

impl UnixTimestamp {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock is set before the Unix epoch")
            .as_secs();
        Self(now)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }
}

/// Wall-clock capability.
///
/// The core never reads the system clock directly outside of
/// [`SystemClock`]; every component takes a `Clock` so tests can drive time
/// deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimestamp;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimestamp {
        UnixTimestamp::now()
    }
}

/// A manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn at(secs: u64) -> Self {
        Self(AtomicU64::new(secs))
    }

    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UnixTimestamp {
        UnixTimestamp::from_secs(self.0.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_serde_roundtrip() {
        let ts = UnixTimestamp::from_secs(1699999999);
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"1699999999\"");
        let back: UnixTimestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_timestamp_deserialize_rejects_non_numeric() {
        let result: Result<UnixTimestamp, _> = serde_json::from_str("\"not-a-number\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::at(1000);
        assert_eq!(clock.now().as_secs(), 1000);
        clock.advance(SECONDS_PER_DAY);
        assert_eq!(clock.now().as_secs(), 1000 + SECONDS_PER_DAY);
    }

    #[test]
    fn test_saturating_arithmetic() {
        let ts = UnixTimestamp::from_secs(10);
        assert_eq!((ts - 20).as_secs(), 0);
        assert_eq!((ts + 5).as_secs(), 15);
    }
}
