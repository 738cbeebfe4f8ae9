use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Timing jitter tolerated between consecutive candles (milliseconds)
pub const CANDLE_JITTER_MS: i64 = 10;

/// OHLCV candlestick for one fixed time bucket
///
/// `time` is the bucket open time in epoch milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
}

impl Candle {
    /// Close time of the bucket for the given interval
    pub fn close_time(&self, interval: Interval) -> i64 {
        self.time + interval.as_millis()
    }

    /// True if `next` is exactly the bar following `self`, within jitter
    pub fn is_followed_by(&self, next: &Candle, interval: Interval) -> bool {
        let diff = next.time - self.time;
        diff > CANDLE_JITTER_MS && diff <= interval.as_millis() + CANDLE_JITTER_MS
    }
}

/// Candle bucket duration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Interval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H12,
    D1,
    D7,
    D30,
}

impl Interval {
    pub const ALL: [Interval; 13] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H12,
        Interval::D1,
        Interval::D7,
        Interval::D30,
    ];

    pub fn as_minutes(self) -> u32 {
        match self {
            Interval::M1 => 1,
            Interval::M3 => 3,
            Interval::M5 => 5,
            Interval::M15 => 15,
            Interval::M30 => 30,
            Interval::H1 => 60,
            Interval::H2 => 120,
            Interval::H4 => 240,
            Interval::H6 => 360,
            Interval::H12 => 720,
            Interval::D1 => 1440,
            Interval::D7 => 10080,
            Interval::D30 => 43200,
        }
    }

    pub fn as_secs(self) -> i64 {
        self.as_minutes() as i64 * 60
    }

    pub fn as_millis(self) -> i64 {
        self.as_secs() * 1000
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.as_secs() as u64)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Interval::M1 => "M1",
            Interval::M3 => "M3",
            Interval::M5 => "M5",
            Interval::M15 => "M15",
            Interval::M30 => "M30",
            Interval::H1 => "H1",
            Interval::H2 => "H2",
            Interval::H4 => "H4",
            Interval::H6 => "H6",
            Interval::H12 => "H12",
            Interval::D1 => "D1",
            Interval::D7 => "D7",
            Interval::D30 => "D30",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl TryFrom<u32> for Interval {
    type Error = Error;

    fn try_from(minutes: u32) -> Result<Self, Self::Error> {
        Interval::ALL
            .into_iter()
            .find(|i| i.as_minutes() == minutes)
            .ok_or_else(|| Error::InvalidInterval(minutes.to_string()))
    }
}

impl From<Interval> for u32 {
    fn from(interval: Interval) -> Self {
        interval.as_minutes()
    }
}

/// Accepts either the display name (`"H1"`) or the minute count (`"60"`)
impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase();
        if let Ok(minutes) = normalized.parse::<u32>() {
            return Interval::try_from(minutes).map_err(|_| Error::InvalidInterval(s.to_string()));
        }
        Interval::ALL
            .into_iter()
            .find(|i| i.display_name() == normalized)
            .ok_or_else(|| Error::InvalidInterval(s.to_string()))
    }
}

/// One update from a live candle stream
///
/// Unconfirmed updates describe the still-open bar; confirmed ones carry the
/// final values of a closed bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleStreamUpdate {
    pub candle: Candle,
    pub confirmed: bool,
    pub interval: Interval,
}
