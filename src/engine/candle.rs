use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::utils::ms_to_datetime;

/// Candle durations supported by the instrument cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFrame {
    /// One minute.
    Min1,
    /// Five minutes.
    Min5,
    /// Fifteen minutes.
    Min15,
    /// Thirty minutes.
    Min30,
    /// One hour.
    Hour1,
    /// Four hours.
    Hour4,
    /// One day.
    Day1,
    /// One week.
    Week1,
}

impl TimeFrame {
    /// Returns the length of one bucket in milliseconds.
    pub fn millis(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        match self {
            Self::Min1 => MINUTE,
            Self::Min5 => 5 * MINUTE,
            Self::Min15 => 15 * MINUTE,
            Self::Min30 => 30 * MINUTE,
            Self::Hour1 => 60 * MINUTE,
            Self::Hour4 => 240 * MINUTE,
            Self::Day1 => 1440 * MINUTE,
            Self::Week1 => 7 * 1440 * MINUTE,
        }
    }
}

/// OHLCV snapshot of one time bucket.
///
/// `timestamp` is the bucket start in unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    median: f64,
    volume: f64,
}

/// Builder for [`Candle`], checking the OHLC invariants on `build`.
///
/// ### Example
/// ```rust
/// use swing_rs::engine::CandleBuilder;
///
/// let candle = CandleBuilder::builder()
///     .timestamp(0)
///     .open(100.0)
///     .high(110.0)
///     .low(95.0)
///     .close(105.0)
///     .volume(1.0)
///     .build()
///     .unwrap();
/// assert_eq!(candle.median(), 102.5);
/// ```
#[derive(Debug, Default)]
pub struct CandleBuilder {
    timestamp: i64,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    median: Option<f64>,
    volume: f64,
}

impl CandleBuilder {
    /// Starts a new builder.
    pub fn builder() -> Self {
        Self::default()
    }

    /// Sets the bucket start (unix ms).
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the open price.
    pub fn open(mut self, open: f64) -> Self {
        self.open = Some(open);
        self
    }

    /// Sets the high price.
    pub fn high(mut self, high: f64) -> Self {
        self.high = Some(high);
        self
    }

    /// Sets the low price.
    pub fn low(mut self, low: f64) -> Self {
        self.low = Some(low);
        self
    }

    /// Sets the close price.
    pub fn close(mut self, close: f64) -> Self {
        self.close = Some(close);
        self
    }

    /// Sets the median price. Defaults to the middle of the high/low range.
    pub fn median(mut self, median: f64) -> Self {
        self.median = Some(median);
        self
    }

    /// Sets the traded volume.
    pub fn volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    /// Builds the candle.
    ///
    /// ### Returns
    /// The candle, or `Error::InvalidCandle` if a price is missing or the invariants
    /// `high >= max(open, close)`, `low <= min(open, close)`, `volume >= 0` do not hold.
    pub fn build(self) -> Result<Candle> {
        let missing = |name: &str| Error::InvalidCandle(format!("missing {name}"));
        let open = self.open.ok_or_else(|| missing("open"))?;
        let high = self.high.ok_or_else(|| missing("high"))?;
        let low = self.low.ok_or_else(|| missing("low"))?;
        let close = self.close.ok_or_else(|| missing("close"))?;
        let median = self.median.unwrap_or((high + low) / 2.0);

        let candle = Candle {
            timestamp: self.timestamp,
            open,
            high,
            low,
            close,
            median,
            volume: self.volume,
        };
        candle.check()?;
        Ok(candle)
    }
}

impl TryFrom<(i64, f64, f64, f64, f64, f64)> for Candle {
    type Error = Error;

    fn try_from((timestamp, open, high, low, close, volume): (i64, f64, f64, f64, f64, f64)) -> Result<Self> {
        CandleBuilder::builder()
            .timestamp(timestamp)
            .open(open)
            .high(high)
            .low(low)
            .close(close)
            .volume(volume)
            .build()
    }
}

impl Candle {
    fn check(&self) -> Result<()> {
        let prices = [self.open, self.high, self.low, self.close, self.median, self.volume];
        if prices.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidCandle(format!("non finite value in {self:?}")));
        }
        if self.high < self.open.max(self.close) || self.low > self.open.min(self.close) || self.high < self.low {
            return Err(Error::InvalidCandle(format!(
                "o:{} h:{} l:{} c:{}",
                self.open, self.high, self.low, self.close
            )));
        }
        if self.volume < 0.0 {
            return Err(Error::InvalidCandle(format!("negative volume {}", self.volume)));
        }
        Ok(())
    }

    /// Open time in unix milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Open time as a `DateTime`.
    pub fn open_time(&self) -> DateTime<Utc> {
        ms_to_datetime(self.timestamp)
    }

    /// Opening price.
    pub fn open(&self) -> f64 {
        self.open
    }

    /// Highest price.
    pub fn high(&self) -> f64 {
        self.high
    }

    /// Lowest price.
    pub fn low(&self) -> f64 {
        self.low
    }

    /// Closing price.
    pub fn close(&self) -> f64 {
        self.close
    }

    /// Median price, the middle of high and low unless the builder set one.
    pub fn median(&self) -> f64 {
        self.median
    }

    /// Traded volume.
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// True if the candle closed at or above its open.
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    /// Refreshes this candle from a newer copy of the same bucket.
    ///
    /// ### Returns
    /// `Error::CandleTimestampMismatch` if `rhs` belongs to another bucket.
    pub fn update(&mut self, rhs: &Candle) -> Result<()> {
        if rhs.timestamp != self.timestamp {
            return Err(Error::CandleTimestampMismatch {
                expected: self.timestamp,
                got: rhs.timestamp,
            });
        }
        *self = *rhs;
        Ok(())
    }

    /// Returns the part of this candle that existed at time `at`.
    ///
    /// Price is assumed to move linearly along Open -> Low -> High -> Close for a bullish
    /// candle and Open -> High -> Low -> Close otherwise. The returned candle keeps the
    /// timestamp, closes at the interpolated price, and has its volume scaled by the elapsed
    /// fraction of the bucket.
    ///
    /// ### Arguments
    /// * `at` - Time (unix ms), clamped to the bucket.
    /// * `time_frame` - The bucket length.
    pub fn sub_candle(&self, at: i64, time_frame: TimeFrame) -> Candle {
        let frac = ((at - self.timestamp) as f64 / time_frame.millis() as f64).clamp(0.0, 1.0);
        let path = if self.is_bullish() {
            [self.open, self.low, self.high, self.close]
        } else {
            [self.open, self.high, self.low, self.close]
        };
        let length: f64 = path.windows(2).map(|w| (w[1] - w[0]).abs()).sum();

        let mut remaining = frac * length;
        let mut price = self.open;
        let mut high = self.open;
        let mut low = self.open;
        for w in path.windows(2) {
            let segment = (w[1] - w[0]).abs();
            if remaining >= segment {
                price = w[1];
                remaining -= segment;
            } else {
                price = w[0] + (w[1] - w[0]).signum() * remaining;
                remaining = 0.0;
            }
            high = high.max(price);
            low = low.min(price);
            if remaining <= 0.0 {
                break;
            }
        }

        Candle {
            timestamp: self.timestamp,
            open: self.open,
            high,
            low,
            close: price,
            median: (high + low) / 2.0,
            volume: self.volume * frac,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bullish() -> Candle {
        // path length: 10 (100->90) + 30 (90->120) + 10 (120->110) = 50
        Candle::try_from((0i64, 100.0, 120.0, 90.0, 110.0, 50.0)).unwrap()
    }

    #[test]
    fn build_rejects_broken_invariants() {
        assert!(matches!(
            Candle::try_from((0i64, 100.0, 99.0, 90.0, 95.0, 1.0)),
            Err(Error::InvalidCandle(_))
        ));
        assert!(matches!(
            Candle::try_from((0i64, 100.0, 110.0, 101.0, 105.0, 1.0)),
            Err(Error::InvalidCandle(_))
        ));
        assert!(matches!(
            Candle::try_from((0i64, 100.0, 110.0, 90.0, 105.0, -1.0)),
            Err(Error::InvalidCandle(_))
        ));
        assert!(matches!(
            CandleBuilder::builder().open(1.0).build(),
            Err(Error::InvalidCandle(_))
        ));
    }

    #[test]
    fn update_same_bucket() {
        let mut candle = bullish();
        let newer = Candle::try_from((0i64, 100.0, 125.0, 90.0, 124.0, 60.0)).unwrap();
        candle.update(&newer).unwrap();
        assert_eq!(candle.high(), 125.0);
        assert_eq!(candle.close(), 124.0);
        assert_eq!(candle.volume(), 60.0);
    }

    #[test]
    fn update_other_bucket_fails() {
        let mut candle = bullish();
        let other = Candle::try_from((60_000i64, 100.0, 125.0, 90.0, 124.0, 60.0)).unwrap();
        let result = candle.update(&other);
        assert!(matches!(
            result,
            Err(Error::CandleTimestampMismatch {
                expected: 0,
                got: 60_000
            })
        ));
        assert_eq!(candle, bullish());
    }

    #[test]
    fn sub_candle_at_start_and_end() {
        let candle = bullish();
        let start = candle.sub_candle(0, TimeFrame::Min1);
        assert_eq!(start.close(), 100.0);
        assert_eq!(start.high(), 100.0);
        assert_eq!(start.low(), 100.0);
        assert_eq!(start.volume(), 0.0);

        let end = candle.sub_candle(60_000, TimeFrame::Min1);
        assert_eq!(end.close(), 110.0);
        assert_eq!(end.high(), 120.0);
        assert_eq!(end.low(), 90.0);
        assert_eq!(end.volume(), 50.0);
    }

    #[test]
    fn sub_candle_walks_low_then_high_when_bullish() {
        let candle = bullish();
        // 20% of 50 = 10 -> reached the low
        let sub = candle.sub_candle(12_000, TimeFrame::Min1);
        assert!((sub.close() - 90.0).abs() < 1e-9);
        assert_eq!(sub.high(), 100.0);
        // 50% of 50 = 25 -> 15 into the climb from 90
        let sub = candle.sub_candle(30_000, TimeFrame::Min1);
        assert!((sub.close() - 105.0).abs() < 1e-9);
        assert!((sub.low() - 90.0).abs() < 1e-9);
        assert!((sub.volume() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn sub_candle_walks_high_then_low_when_bearish() {
        // path: 100->120 (20), 120->80 (40), 80->90 (10) = 70
        let candle = Candle::try_from((0i64, 100.0, 120.0, 80.0, 90.0, 1.0)).unwrap();
        let sub = candle.sub_candle(30_000, TimeFrame::Min1); // 35 along
        assert!((sub.close() - 105.0).abs() < 1e-9);
        assert!((sub.high() - 120.0).abs() < 1e-9);
        assert_eq!(sub.low(), 100.0);
    }

    #[test]
    fn time_frame_lengths() {
        assert_eq!(TimeFrame::Min1.millis(), 60_000);
        assert_eq!(TimeFrame::Hour1.millis(), 3_600_000);
        assert_eq!(TimeFrame::Day1.millis(), 86_400_000);
    }
}
