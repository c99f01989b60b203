//! Small helpers shared by the edgemq crates.
//!
//! - [`Bytesize`] parses and prints sizes such as `"1M"` or `"2G512M"`.
//! - [`to_duration`] parses durations such as `"100ms"` or `"1h30m"`, with
//!   [`deserialize_duration`] for use in `#[serde(deserialize_with = ...)]`.
//! - Millisecond timestamps used by the stores and the resend engine.
//! - [`Counter`], a lock free current/max gauge.
//!
//! ```
//! use edgemq_utils::{to_bytesize, to_duration};
//!
//! assert_eq!(to_bytesize("2M"), 2 * 1024 * 1024);
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(to_duration("250ms").as_millis(), 250);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::ops::Deref;
use std::time::Duration;

use serde::{
    de::{self, Deserializer},
    Deserialize,
};

mod counter;

pub use counter::Counter;

/// Milliseconds since the Unix epoch
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

/// Byte count that reads and writes as `1G512M`, `64K`, `100B`.
///
/// ```
/// use edgemq_utils::Bytesize;
///
/// assert_eq!(Bytesize::from("1M").as_usize(), 1048576);
/// assert_eq!(Bytesize(1024).to_string(), "1K");
/// ```
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut v = self.0;
        for (unit, size) in [('G', BYTESIZE_G), ('M', BYTESIZE_M), ('K', BYTESIZE_K)] {
            if v >= size {
                write!(f, "{}{}", v / size, unit)?;
                v %= size;
            }
        }
        if v > 0 || self.0 == 0 {
            write!(f, "{}B", v)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        let v = to_bytesize(&text);
        if v == 0 && text.trim_start_matches('0').chars().any(|c| c.is_ascii_digit()) {
            return Err(de::Error::custom(format!("invalid byte size `{}`", text)));
        }
        Ok(Bytesize(v))
    }
}

/// Parses `2G512K`, `64KB`, `100` (plain bytes) into a byte count. Malformed parts count as zero.
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    let text = text.trim().to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    if let Ok(v) = text.parse::<usize>() {
        return v;
    }
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<usize>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'B' => v,
                'K' => v * BYTESIZE_K,
                'M' => v * BYTESIZE_M,
                'G' => v * BYTESIZE_G,
                _ => 0,
            }
        })
        .sum()
}

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Converts a duration string to a [`Duration`].
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. Parts are summed, so `1h30m15s` is 5415 seconds.
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                'w' => v * 604800000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_duration() {
        assert_eq!(to_duration("100ms"), Duration::from_millis(100));
        assert_eq!(to_duration("20s"), Duration::from_secs(20));
        assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
        assert_eq!(to_duration("1d").as_secs(), 86400);
        assert_eq!(to_duration("1m500ms").as_millis(), 60500);
        assert_eq!(to_duration("abc"), Duration::ZERO);
    }

    #[test]
    fn test_bytesize() {
        assert_eq!(to_bytesize("1M"), 1048576);
        assert_eq!(to_bytesize("64KB"), 65536);
        assert_eq!(to_bytesize("2G512M"), 2_684_354_560);
        assert_eq!(to_bytesize("512"), 512);
        assert_eq!(Bytesize(3145728).to_string(), "3M");
        assert_eq!(Bytesize(1025).to_string(), "1K1B");
        assert_eq!(format!("{:?}", Bytesize(0)), "0B");
    }

    #[test]
    fn test_deserialize() {
        #[derive(Deserialize)]
        struct Cfg {
            #[serde(deserialize_with = "deserialize_duration")]
            interval: Duration,
            size: Bytesize,
        }
        let cfg: Cfg = serde_json::from_str(r#"{"interval":"500ms","size":"1K"}"#).unwrap();
        assert_eq!(cfg.interval, Duration::from_millis(500));
        assert_eq!(cfg.size.as_usize(), 1024);
    }
}
