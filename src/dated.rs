//! Module `dated` implement time-ordered unique identifiers.
//!
//! A [DatedId] combines a GMT date, at second resolution, with a random
//! 64-bit token. Its rendered rawvalue,
//!
//! ```text
//! YYYY-MM-DD HH-MM-SS TTTTTTTTTTTTTTTT
//! ```
//!
//! is exactly 36 characters, zero padded, token in upper-case hex. Since
//! every field is fixed width, lexicographic order of the rawvalue equals
//! chronological order, which is why the same rawvalue doubles up as file
//! name on disk and as identifier within containing manifests.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use std::{cmp, fmt, result, str::FromStr};

use crate::{Error, Result};

/// Length of the rendered rawvalue, in bytes.
pub const RAW_LEN: usize = 36;

/// Unique time-ordered identifier, used as file name for every persisted
/// object and as identifier within containing objects.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DatedId {
    date: DateTime<Utc>, // truncated to second resolution
    token: u64,
}

impl PartialOrd for DatedId {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DatedId {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        match self.date.cmp(&other.date) {
            cmp::Ordering::Equal => self.token.cmp(&other.token),
            c => c,
        }
    }
}

impl fmt::Display for DatedId {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}-{:02}-{:02} {:016X}",
            self.date.year(),
            self.date.month(),
            self.date.day(),
            self.date.hour(),
            self.date.minute(),
            self.date.second(),
            self.token
        )
    }
}

impl fmt::Debug for DatedId {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}", self)
    }
}

impl FromStr for DatedId {
    type Err = Error;

    fn from_str(s: &str) -> Result<DatedId> {
        let raw = s.as_bytes();
        if raw.len() != RAW_LEN {
            return err_at!(InvalidInput, msg: "dated-id {:?} length {}", s, raw.len());
        }
        for (off, sep) in [(4, b'-'), (7, b'-'), (10, b' '), (13, b'-'), (16, b'-'), (19, b' ')]
            .iter()
        {
            if raw[*off] != *sep {
                return err_at!(InvalidInput, msg: "dated-id {:?} separator at {}", s, off);
            }
        }

        let field = |from: usize, to: usize| -> Result<&str> {
            match std::str::from_utf8(&raw[from..to]) {
                Ok(field) => Ok(field),
                Err(_) => err_at!(InvalidInput, msg: "dated-id {:?} field", s),
            }
        };
        let year: i32 = err_at!(FailConvert, field(0, 4)?.parse())?;
        let month: u32 = err_at!(FailConvert, field(5, 7)?.parse())?;
        let day: u32 = err_at!(FailConvert, field(8, 10)?.parse())?;
        let hour: u32 = err_at!(FailConvert, field(11, 13)?.parse())?;
        let minute: u32 = err_at!(FailConvert, field(14, 16)?.parse())?;
        let second: u32 = err_at!(FailConvert, field(17, 19)?.parse())?;
        let token = err_at!(FailConvert, u64::from_str_radix(field(20, 36)?, 16))?;

        let date = match Utc.ymd_opt(year, month, day).single() {
            Some(date) => match date.and_hms_opt(hour, minute, second) {
                Some(date) => date,
                None => return err_at!(InvalidInput, msg: "dated-id {:?} time", s),
            },
            None => return err_at!(InvalidInput, msg: "dated-id {:?} date", s),
        };

        Ok(DatedId { date, token })
    }
}

impl DatedId {
    /// Generate a fresh identifier for the current GMT time.
    pub fn generate() -> DatedId {
        DatedId::from_parts(Utc::now(), rand::random::<u64>())
    }

    /// Construct an identifier from `date` and `token`. Sub-second
    /// precision of `date` is discarded.
    pub fn from_parts(date: DateTime<Utc>, token: u64) -> DatedId {
        let date = Utc.timestamp(date.timestamp(), 0);
        DatedId { date, token }
    }

    pub fn to_date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn to_token(&self) -> u64 {
        self.token
    }

    pub fn to_year(&self) -> i32 {
        self.date.year()
    }

    pub fn to_month_day(&self) -> (u32, u32) {
        (self.date.month(), self.date.day())
    }

    pub fn to_hour_minute(&self) -> (u32, u32) {
        (self.date.hour(), self.date.minute())
    }

    pub fn to_second(&self) -> u32 {
        self.date.second()
    }

    /// Return the dated directory triplet `["YYYY", "MM-DD", "HH-MM"]`
    /// under which files named by this identifier are nested, so that no
    /// single directory grows huge.
    pub fn to_dated_dirs(&self) -> [String; 3] {
        [
            format!("{:04}", self.date.year()),
            format!("{:02}-{:02}", self.date.month(), self.date.day()),
            format!("{:02}-{:02}", self.date.hour(), self.date.minute()),
        ]
    }
}

impl Serialize for DatedId {
    fn serialize<S>(&self, serializer: S) -> result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DatedId {
    fn deserialize<D>(deserializer: D) -> result::Result<DatedId, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DatedId::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
#[path = "dated_test.rs"]
mod dated_test;
