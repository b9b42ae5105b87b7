use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context};
use serde::{de, Deserialize, Deserializer, Serialize};

/// The number of milliseconds since the [`UNIX_EPOCH`].
///
/// Internally a non-negative [`i64`] for interoperability with storage
/// backends that lack unsigned integers.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct TimestampMs(i64);

impl TimestampMs {
    /// Creates a new [`TimestampMs`] from the current [`SystemTime`].
    ///
    /// Panics if the current time is not within bounds.
    pub fn now() -> Self {
        Self::try_from(SystemTime::now()).unwrap()
    }

    /// Returns the contained [`i64`].
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<TimestampMs> for SystemTime {
    fn from(timestamp: TimestampMs) -> Self {
        let millis =
            u64::try_from(timestamp.0).expect("Invariant: non-negative");
        UNIX_EPOCH + Duration::from_millis(millis)
    }
}

impl TryFrom<SystemTime> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(system_time: SystemTime) -> anyhow::Result<Self> {
        let millis = system_time
            .duration_since(UNIX_EPOCH)
            .context("Current time is before January 1st, 1970")?
            .as_millis();
        i64::try_from(millis)
            .map(Self)
            .context("Current time does not fit in an i64 of millis")
    }
}

impl TryFrom<i64> for TimestampMs {
    type Error = anyhow::Error;
    fn try_from(inner: i64) -> anyhow::Result<Self> {
        if inner >= 0 {
            Ok(Self(inner))
        } else {
            Err(anyhow!("Timestamp must be non-negative"))
        }
    }
}

/// Construct a [`TimestampMs`] from a [`u32`]. Useful in tests.
impl From<u32> for TimestampMs {
    fn from(inner: u32) -> Self {
        Self(i64::from(inner))
    }
}

/// Enforces that the inner [`i64`] is non-negative.
impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner = i64::deserialize(deserializer)?;
        Self::try_from(inner).map_err(de::Error::custom)
    }
}
