use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::engine::{Candle, CandleBuilder};
use crate::errors::{Error, Result};

// "open_time": 1759813200000,
// "open_price": 124499.99,
// "high_price": 124640.76,
// "low_price": 124240.37,
// "close_price": 124414.17,
// "volume": 424.20697,
// ...

#[derive(Debug, Clone, Deserialize)]
struct Data {
    open_time: i64,
    #[serde(alias = "open_price")]
    open: f64,
    #[serde(alias = "high_price")]
    high: f64,
    #[serde(alias = "low_price")]
    low: f64,
    #[serde(alias = "close_price")]
    close: f64,
    volume: f64,
}

impl TryFrom<Data> for Candle {
    type Error = Error;

    fn try_from(d: Data) -> Result<Self> {
        CandleBuilder::builder()
            .timestamp(d.open_time)
            .open(d.open)
            .high(d.high)
            .low(d.low)
            .close(d.close)
            .volume(d.volume)
            .build()
    }
}

/// Reads klines from the JSON file at `filepath` and returns them as candles.
pub fn get_candles_from_file(filepath: std::path::PathBuf) -> Result<Vec<Candle>> {
    use std::{fs::File, io::BufReader};

    let file = File::open(filepath)?;
    let reader = BufReader::new(file);
    let items: Vec<Data> = serde_json::from_reader(reader)?;
    items.into_iter().map(Candle::try_from).collect()
}

/// Converts unix milliseconds to a UTC date time, saturating at the epoch.
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
#[test]
fn parse_klines() {
    let json = r#"[
        {"open_time": 0, "open_price": 10.0, "high_price": 12.0, "low_price": 9.0, "close_price": 11.0, "volume": 3.0},
        {"open_time": 60000, "open": 11.0, "high": 11.5, "low": 10.0, "close": 10.5, "volume": 1.0}
    ]"#;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("klines.json");
    std::fs::write(&path, json).unwrap();

    let candles = get_candles_from_file(path).unwrap();
    assert_eq!(candles.len(), 2);
    assert_eq!(candles[0].close(), 11.0);
    assert_eq!(candles[1].timestamp(), 60_000);
}

#[cfg(test)]
#[test]
fn invalid_kline_is_rejected() {
    let json = r#"[{"open_time": 0, "open": 10.0, "high": 9.0, "low": 8.0, "close": 8.5, "volume": 1.0}]"#;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("klines.json");
    std::fs::write(&path, json).unwrap();
    assert!(matches!(get_candles_from_file(path), Err(Error::InvalidCandle(_))));
}
