//! # models::tick
//!
//! Defines [`Tick`], the raw execution event the brokerage bridge pushes on
//! every trade of a monitored instrument.
//!
//! Keeping this struct minimal is intentional: the aggregation path must
//! process thousands of ticks per second, so a tick carries exactly what the
//! candle builder needs and nothing else.

use serde::{Deserialize, Serialize};

/// A single trade execution received from the bridge feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument code, e.g. `"005930"`.
    pub code: String,

    /// Execution price in currency units.  The bridge already strips the
    /// sign markers the raw feed uses for up/down ticks.
    pub price: i64,

    /// Executed volume (shares).
    pub volume: i64,

    /// Execution time as `HHMMSS`, second resolution.
    pub exec_time: String,
}

impl Tick {
    /// A tick is usable only if price and volume are positive and the
    /// execution time is long enough to carry a minute bucket.
    ///
    /// Invalid ticks are dropped before they touch any state.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.price > 0 && self.volume > 0 && self.exec_time.len() >= 4
    }

    /// Minute bucket (`HHMM`) this tick falls into.
    ///
    /// Callers must check [`Tick::is_valid`] first — the slice assumes the
    /// time field is at least four characters.
    #[inline]
    pub fn minute_bucket(&self) -> &str {
        &self.exec_time[..4]
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tick(price: i64, volume: i64) -> Tick {
        Tick {
            code: "005930".to_string(),
            price,
            volume,
            exec_time: "093015".to_string(),
        }
    }

    #[test]
    fn test_minute_bucket() {
        assert_eq!(make_tick(1000, 10).minute_bucket(), "0930");
    }

    #[test]
    fn test_validity() {
        assert!(make_tick(1000, 10).is_valid());
        assert!(!make_tick(0, 10).is_valid());
        assert!(!make_tick(-500, 10).is_valid());
        assert!(!make_tick(1000, 0).is_valid());

        let mut short = make_tick(1000, 10);
        short.exec_time = "93".to_string();
        assert!(!short.is_valid());
    }
}
