use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::engine::{Candle, CandleBuilder, TimeFrame, TradePair};
use crate::errors::{Error, Result};

/// Default number of candles loaded per cache chunk.
pub const CACHE_CHUNK_SIZE: usize = 1000;

/// A source of candles for one pair and time frame, indexed from the oldest candle.
pub trait PriceData: Send + Sync {
    /// Number of candles available.
    fn count(&self) -> usize;

    /// Number of candles whose timestamp is at or before `timestamp`.
    fn count_to(&self, timestamp: i64) -> usize;

    /// Reads the candles in `range`.
    fn read_candles(&self, range: Range<usize>) -> Result<Vec<Candle>>;

    /// Length of one candle.
    fn time_frame(&self) -> TimeFrame;
}

/// What changed in a [`PriceData`] source.
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent {
    /// A new bucket opened with `candle`.
    New {
        /// The first report of the new bucket.
        candle: Candle,
    },
    /// The still-open latest bucket was revised.
    Current {
        /// The revised latest candle.
        candle: Candle,
    },
    /// An arbitrary span of candles changed.
    Range {
        /// The indices that changed.
        range: Range<usize>,
    },
}

/// In-memory candle source.
#[derive(Debug, Clone)]
pub struct MemoryPriceData {
    time_frame: TimeFrame,
    candles: Vec<Candle>,
}

impl MemoryPriceData {
    /// Creates a source over `candles`, which must be in strictly ascending time order.
    pub fn new(time_frame: TimeFrame, candles: Vec<Candle>) -> Result<Self> {
        if let Some(i) = candles.windows(2).position(|w| w[0].timestamp() >= w[1].timestamp()) {
            return Err(Error::InvalidCandle(format!(
                "timestamps not ascending at index {}",
                i + 1
            )));
        }
        Ok(Self { time_frame, candles })
    }

    /// Appends a candle, or revises the latest one if it has the same timestamp.
    pub fn push(&mut self, candle: Candle) -> Result<DataEvent> {
        if let Some(last) = self.candles.last_mut() {
            if last.timestamp() == candle.timestamp() {
                last.update(&candle)?;
                return Ok(DataEvent::Current { candle });
            }
            if last.timestamp() > candle.timestamp() {
                return Err(Error::CandleTimestampMismatch {
                    expected: last.timestamp(),
                    got: candle.timestamp(),
                });
            }
        }
        self.candles.push(candle);
        Ok(DataEvent::New { candle })
    }

    /// Revises the latest candle.
    pub fn update_latest(&mut self, candle: Candle) -> Result<DataEvent> {
        let last = self.candles.last_mut().ok_or(Error::CandleDataEmpty)?;
        last.update(&candle)?;
        Ok(DataEvent::Current { candle })
    }

    /// Overwrites candles from index `start` on with `candles`.
    pub fn replace_range(&mut self, start: usize, candles: Vec<Candle>) -> Result<DataEvent> {
        if start > self.candles.len() {
            return Err(Error::IndexOutOfRange {
                index: start,
                count: self.candles.len(),
            });
        }
        let end = start + candles.len();
        let mut merged = self.candles[..start].to_vec();
        merged.extend(candles);
        if end < self.candles.len() {
            merged.extend_from_slice(&self.candles[end..]);
        }
        *self = Self::new(self.time_frame, merged)?;
        Ok(DataEvent::Range { range: start..end })
    }
}

impl PriceData for MemoryPriceData {
    fn count(&self) -> usize {
        self.candles.len()
    }

    fn count_to(&self, timestamp: i64) -> usize {
        self.candles.partition_point(|c| c.timestamp() <= timestamp)
    }

    fn read_candles(&self, range: Range<usize>) -> Result<Vec<Candle>> {
        self.candles
            .get(range.clone())
            .map(<[Candle]>::to_vec)
            .ok_or(Error::IndexOutOfRange {
                index: range.end.saturating_sub(1),
                count: self.candles.len(),
            })
    }

    fn time_frame(&self) -> TimeFrame {
        self.time_frame
    }
}

/// A source shared between its writer and an [`Instrument`].
impl<T: PriceData> PriceData for Arc<RwLock<T>> {
    fn count(&self) -> usize {
        self.read().count()
    }

    fn count_to(&self, timestamp: i64) -> usize {
        self.read().count_to(timestamp)
    }

    fn read_candles(&self, range: Range<usize>) -> Result<Vec<Candle>> {
        self.read().read_candles(range)
    }

    fn time_frame(&self) -> TimeFrame {
        self.read().time_frame()
    }
}

/// How an instrument derives its candles from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandleStyle {
    /// Source candles as they are.
    #[default]
    Standard,
    /// Heikin-Ashi smoothed candles.
    HeikinAshi,
}

/// Heikin-Ashi transform.
///
/// Each candle depends on the previous Heikin-Ashi candle, so a range can only be derived
/// forward from a seed. With no seed the first candle opens at the middle of its raw body.
#[derive(Debug, Clone, Default)]
pub struct HeikinAshi {
    prev: Option<Candle>,
}

impl HeikinAshi {
    /// Starts the transform after `seed`, the candle preceding the first one to derive.
    pub fn new(seed: Option<Candle>) -> Self {
        Self { prev: seed }
    }

    /// Derives the Heikin-Ashi candle for `raw`.
    pub fn next(&mut self, raw: &Candle) -> Result<Candle> {
        let open = match &self.prev {
            Some(prev) => (prev.open() + prev.close()) / 2.0,
            None => (raw.open() + raw.close()) / 2.0,
        };
        let close = (raw.open() + raw.high() + raw.low() + raw.close()) / 4.0;
        let candle = CandleBuilder::builder()
            .timestamp(raw.timestamp())
            .open(open)
            .high(raw.high().max(open).max(close))
            .low(raw.low().min(open).min(close))
            .close(close)
            .volume(raw.volume())
            .build()?;
        self.prev = Some(candle);
        Ok(candle)
    }
}

/// Cached, index-addressable view over a [`PriceData`] source for one pair.
///
/// The cache holds the contiguous index range `[first_cached, first_cached + cache.len())` of
/// `[0, count)`. Reading outside it grows the cache in chunks first, so it never has holes.
/// `count` is the number of candles as of "now", which a simulated clock may hold below the
/// source's total.
pub struct Instrument {
    pair: Arc<TradePair>,
    source: Box<dyn PriceData>,
    style: CandleStyle,
    cache: Vec<Candle>,
    first_cached: usize,
    count: Option<usize>,
    chunk_size: usize,
    now: Option<i64>,
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("pair", &self.pair.name())
            .field("style", &self.style)
            .field("cached", &self.cached_range())
            .field("count", &self.count)
            .finish()
    }
}

impl Instrument {
    /// Creates an instrument with an empty cache.
    ///
    /// ### Arguments
    /// * `pair` - The pair the candles price.
    /// * `source` - Where candles are read from.
    /// * `style` - Standard or Heikin-Ashi candles.
    pub fn new(pair: Arc<TradePair>, source: Box<dyn PriceData>, style: CandleStyle) -> Self {
        Self {
            pair,
            source,
            style,
            cache: Vec::new(),
            first_cached: 0,
            count: None,
            chunk_size: CACHE_CHUNK_SIZE,
            now: None,
        }
    }

    /// Sets the number of candles loaded per chunk (at least one).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// The pair the candles price.
    pub fn pair(&self) -> &Arc<TradePair> {
        &self.pair
    }

    /// How candles are derived from the source.
    pub fn style(&self) -> CandleStyle {
        self.style
    }

    /// Period of one candle.
    pub fn time_frame(&self) -> TimeFrame {
        self.source.time_frame()
    }

    /// Switches the candle style, dropping the cache.
    pub fn set_style(&mut self, style: CandleStyle) {
        if self.style != style {
            self.style = style;
            self.invalidate_cached_data();
        }
    }

    /// Pins "now" to `timestamp` (unix ms). Only candles at or before it are visible.
    pub fn set_now(&mut self, timestamp: i64) {
        self.now = Some(timestamp);
        self.count = None;
    }

    /// Number of candles available as of now.
    pub fn count(&mut self) -> usize {
        if let Some(count) = self.count {
            return count;
        }
        let count = match self.now {
            Some(now) => self.source.count_to(now),
            None => self.source.count(),
        };
        // the clock may have moved back past cached candles
        if self.first_cached >= count {
            self.cache.clear();
            self.first_cached = 0;
        } else {
            self.cache.truncate(count - self.first_cached);
        }
        self.count = Some(count);
        count
    }

    /// Index range currently held in memory.
    pub fn cached_range(&self) -> Range<usize> {
        self.first_cached..self.first_cached + self.cache.len()
    }

    /// Drops every cached candle and the cached count.
    pub fn invalidate_cached_data(&mut self) {
        self.cache.clear();
        self.first_cached = 0;
        self.count = None;
    }

    /// Makes sure candle `idx` is in memory.
    ///
    /// `None` stands for "no data" and does nothing. Otherwise the cache grows towards `idx`:
    /// - an empty cache loads two chunks centred on `idx`,
    /// - past the end, whole chunks are appended,
    /// - before the start, whole chunks are prepended. Heikin-Ashi candles are then
    ///   re-derived over the whole cache, since they can't be derived backwards.
    ///
    /// Heikin-Ashi candles are always derived from the first candle of the source, so the
    /// order in which indices are cached never changes their values.
    ///
    /// ### Returns
    /// `Error::IndexOutOfRange` if `idx` is not below `count`.
    pub fn ensure_cached(&mut self, idx: Option<usize>) -> Result<()> {
        let Some(idx) = idx else {
            return Ok(());
        };
        let count = self.count();
        if idx >= count {
            return Err(Error::IndexOutOfRange { index: idx, count });
        }
        let cached = self.cached_range();
        if cached.contains(&idx) {
            return Ok(());
        }

        let chunk = self.chunk_size;
        if self.cache.is_empty() {
            let start = idx.saturating_sub(chunk);
            let end = (idx + chunk).min(count).max(idx + 1);
            self.cache = self.load(start..end)?;
            self.first_cached = start;
        } else if idx >= cached.end {
            let end = (cached.end + (idx + 1 - cached.end).div_ceil(chunk) * chunk).min(count);
            let raw = self.source.read_candles(cached.end..end)?;
            let candles = match self.style {
                CandleStyle::Standard => raw,
                CandleStyle::HeikinAshi => {
                    let mut ha = HeikinAshi::new(self.cache.last().copied());
                    raw.iter().map(|c| ha.next(c)).collect::<Result<Vec<_>>>()?
                }
            };
            self.cache.extend(candles);
        } else {
            let start = cached.start.saturating_sub((cached.start - idx).div_ceil(chunk) * chunk);
            match self.style {
                CandleStyle::Standard => {
                    let mut candles = self.source.read_candles(start..cached.start)?;
                    candles.append(&mut self.cache);
                    self.cache = candles;
                }
                CandleStyle::HeikinAshi => self.cache = self.load(start..cached.end)?,
            }
            self.first_cached = start;
        }
        debug!(pair = %self.pair.name(), cached = ?self.cached_range(), "Candle cache grown");
        Ok(())
    }

    /// Reads `range` from the source in this instrument's style.
    fn load(&self, range: Range<usize>) -> Result<Vec<Candle>> {
        match self.style {
            CandleStyle::Standard => self.source.read_candles(range),
            CandleStyle::HeikinAshi => {
                let mut ha = HeikinAshi::new(self.heikin_ashi_seed(range.start)?);
                self.source
                    .read_candles(range)?
                    .iter()
                    .map(|c| ha.next(c))
                    .collect()
            }
        }
    }

    /// Returns candle `idx`.
    pub fn candle(&mut self, idx: usize) -> Result<Candle> {
        self.ensure_cached(Some(idx))?;
        Ok(self.cache[idx - self.first_cached])
    }

    /// Returns the latest candle, or `None` without data.
    pub fn latest(&mut self) -> Result<Option<Candle>> {
        match self.count().checked_sub(1) {
            Some(idx) => self.candle(idx).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the candles in `range`.
    pub fn candles(&mut self, range: Range<usize>) -> Result<Vec<Candle>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_cached(Some(range.start))?;
        self.ensure_cached(Some(range.end - 1))?;
        let offset = self.first_cached;
        Ok(self.cache[range.start - offset..range.end - offset].to_vec())
    }

    /// Index of the candle whose bucket holds `timestamp`, or `None` before the first candle.
    ///
    /// Timestamps within the cached time span are found by binary search in memory. Others
    /// are counted by the source.
    pub fn index_at(&mut self, timestamp: i64) -> Option<usize> {
        let count = self.count();
        if let (Some(first), Some(last)) = (self.cache.first(), self.cache.last())
            && (first.timestamp()..=last.timestamp()).contains(&timestamp)
        {
            let n = self.cache.partition_point(|c| c.timestamp() <= timestamp);
            return Some(self.first_cached + n - 1);
        }
        self.source.count_to(timestamp).min(count).checked_sub(1)
    }

    /// Fractional index of `timestamp`: the candle index plus the elapsed part of its bucket.
    pub fn findex_at(&mut self, timestamp: i64) -> Result<Option<f64>> {
        let Some(idx) = self.index_at(timestamp) else {
            return Ok(None);
        };
        let candle = self.candle(idx)?;
        let frac = (timestamp - candle.timestamp()) as f64 / self.time_frame().millis() as f64;
        Ok(Some(idx as f64 + frac.clamp(0.0, 1.0)))
    }

    /// Time (unix ms) at fractional index `fidx`.
    pub fn time_at(&mut self, fidx: f64) -> Result<i64> {
        let idx = fidx.max(0.0).floor() as usize;
        let candle = self.candle(idx)?;
        let frac = fidx.max(0.0) - idx as f64;
        Ok(candle.timestamp() + (frac * self.time_frame().millis() as f64) as i64)
    }

    /// Applies a change reported by the source.
    ///
    /// ### Returns
    /// `Error::CandleTimestampMismatch` if a `Current` update is not for the latest candle.
    pub fn on_data_changed(&mut self, event: &DataEvent) -> Result<()> {
        match event {
            DataEvent::New { candle } => self.on_new_candle(candle),
            DataEvent::Current { candle } => self.on_current_candle(candle),
            DataEvent::Range { range } => {
                debug!(pair = %self.pair.name(), ?range, "Candle range changed");
                self.invalidate_cached_data();
                let latest = self.count().checked_sub(1);
                self.ensure_cached(latest)
            }
        }
    }

    fn on_new_candle(&mut self, candle: &Candle) -> Result<()> {
        if self.now.is_some_and(|now| candle.timestamp() > now) {
            return Ok(());
        }
        let Some(prev) = self.source.count_to(candle.timestamp() - 1).checked_sub(1) else {
            self.count = None;
            return Ok(());
        };

        let prev_ts = self.source.read_candles(prev..prev + 1)?.first().map(Candle::timestamp);
        let contiguous = prev_ts.is_some_and(|ts| candle.timestamp() - ts == self.time_frame().millis());

        // the previous candle may have been cached before it was complete
        let had_latest = self.cached_range().contains(&prev);
        if had_latest {
            self.cache.truncate(prev - self.first_cached);
            if self.cache.is_empty() {
                self.first_cached = 0;
            }
        }

        match self.count {
            Some(count) if contiguous && prev + 1 == count => self.count = Some(count + 1),
            Some(_) => {
                debug!(pair = %self.pair.name(), "Gap before new candle, recounting");
                self.count = None;
            }
            None => {}
        }

        if had_latest {
            self.ensure_cached(Some(prev))?;
        }
        Ok(())
    }

    fn on_current_candle(&mut self, candle: &Candle) -> Result<()> {
        let Some(latest) = self.count().checked_sub(1) else {
            return Err(Error::CandleDataEmpty);
        };
        if !self.cached_range().contains(&latest) {
            let expected = self.source.read_candles(latest..latest + 1)?;
            return match expected.first() {
                Some(c) if c.timestamp() == candle.timestamp() => Ok(()),
                Some(c) => Err(Error::CandleTimestampMismatch {
                    expected: c.timestamp(),
                    got: candle.timestamp(),
                }),
                None => Err(Error::CandleDataEmpty),
            };
        }

        let pos = latest - self.first_cached;
        match self.style {
            CandleStyle::Standard => self.cache[pos].update(candle),
            CandleStyle::HeikinAshi => {
                if self.cache[pos].timestamp() != candle.timestamp() {
                    return Err(Error::CandleTimestampMismatch {
                        expected: self.cache[pos].timestamp(),
                        got: candle.timestamp(),
                    });
                }
                self.cache[pos] = match pos {
                    0 => self.seeded_from_source(latest, candle)?,
                    _ => HeikinAshi::new(Some(self.cache[pos - 1])).next(candle)?,
                };
                Ok(())
            }
        }
    }

    /// Heikin-Ashi candle for `raw` at `idx`.
    fn seeded_from_source(&self, idx: usize, raw: &Candle) -> Result<Candle> {
        HeikinAshi::new(self.heikin_ashi_seed(idx)?).next(raw)
    }

    /// Heikin-Ashi candle before `idx`, derived forward from the first candle of the source
    /// one chunk at a time, so a given index always yields the same candle.
    fn heikin_ashi_seed(&self, idx: usize) -> Result<Option<Candle>> {
        let mut ha = HeikinAshi::new(None);
        let mut seed = None;
        let mut start = 0;
        while start < idx {
            let end = (start + self.chunk_size).min(idx);
            for raw in self.source.read_candles(start..end)? {
                seed = Some(ha.next(&raw)?);
            }
            start = end;
        }
        Ok(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Coin;

    const MIN: i64 = 60_000;

    fn candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.7).sin() * 10.0;
                let close = base + if i % 3 == 0 { -1.5 } else { 2.0 };
                Candle::try_from((
                    i as i64 * MIN,
                    base,
                    base.max(close) + 1.0,
                    base.min(close) - 1.0,
                    close,
                    10.0 + i as f64,
                ))
                .unwrap()
            })
            .collect()
    }

    fn pair() -> Arc<TradePair> {
        Arc::new(TradePair::new(Coin::new("BTC", "Sim"), Coin::new("USDT", "Sim"), 0.0))
    }

    fn instrument(n: usize, style: CandleStyle) -> Instrument {
        let source = MemoryPriceData::new(TimeFrame::Min1, candles(n)).unwrap();
        Instrument::new(pair(), Box::new(source), style).with_chunk_size(4)
    }

    #[test]
    fn sentinel_is_a_no_op() {
        let mut inst = instrument(10, CandleStyle::Standard);
        inst.ensure_cached(None).unwrap();
        assert!(inst.cached_range().is_empty());
    }

    #[test]
    fn index_past_count_is_out_of_range() {
        let mut inst = instrument(10, CandleStyle::Standard);
        let result = inst.ensure_cached(Some(10));
        assert!(matches!(result, Err(Error::IndexOutOfRange { index: 10, count: 10 })));
        assert!(inst.ensure_cached(Some(9)).is_ok());
    }

    #[test]
    fn first_load_is_centred() {
        let mut inst = instrument(100, CandleStyle::Standard);
        inst.ensure_cached(Some(50)).unwrap();
        assert_eq!(inst.cached_range(), 46..54);
        inst.ensure_cached(Some(2)).unwrap();
        assert_eq!(inst.cached_range(), 2..54);
    }

    #[test]
    fn cache_stays_contiguous() {
        let mut inst = instrument(100, CandleStyle::Standard);
        let source = candles(100);
        let mut requested = Vec::new();
        for idx in [50, 57, 43, 99, 0, 61, 20, 75] {
            inst.ensure_cached(Some(idx)).unwrap();
            requested.push(idx);
            let range = inst.cached_range();
            for r in &requested {
                assert!(range.contains(r), "{r} not in {range:?}");
            }
            for i in range {
                assert_eq!(inst.candle(i).unwrap(), source[i]);
            }
        }
    }

    #[test]
    fn forward_growth_is_chunked() {
        let mut inst = instrument(100, CandleStyle::Standard);
        inst.ensure_cached(Some(10)).unwrap();
        assert_eq!(inst.cached_range(), 6..14);
        // 15 - 14 = 1 -> one chunk of 4
        inst.ensure_cached(Some(14)).unwrap();
        assert_eq!(inst.cached_range(), 6..18);
        // 25 - 18 = 7 -> two chunks
        inst.ensure_cached(Some(24)).unwrap();
        assert_eq!(inst.cached_range(), 6..26);
    }

    #[test]
    fn heikin_ashi_recurrence() {
        let mut inst = instrument(30, CandleStyle::HeikinAshi);
        let raw = candles(30);
        let ha = inst.candles(0..30).unwrap();
        for i in 1..ha.len() {
            let r = &raw[i];
            let close = (r.open() + r.high() + r.low() + r.close()) / 4.0;
            let open = (ha[i - 1].open() + ha[i - 1].close()) / 2.0;
            assert!((ha[i].close() - close).abs() < 1e-9);
            assert!((ha[i].open() - open).abs() < 1e-9);
            assert!((ha[i].high() - r.high().max(open).max(close)).abs() < 1e-9);
            assert!((ha[i].low() - r.low().min(open).min(close)).abs() < 1e-9);
        }
    }

    #[test]
    fn heikin_ashi_backward_fill_rederives() {
        let mut inst = instrument(40, CandleStyle::HeikinAshi);
        inst.ensure_cached(Some(30)).unwrap();
        assert_eq!(inst.cached_range(), 26..34);
        inst.ensure_cached(Some(20)).unwrap();
        let range = inst.cached_range();
        assert_eq!(range, 18..34);

        // same as deriving forward from the first candle
        let raw = candles(40);
        let mut ha = HeikinAshi::new(None);
        let expected: Vec<Candle> = raw.iter().map(|c| ha.next(c).unwrap()).collect();
        for i in range {
            assert_eq!(inst.candle(i).unwrap(), expected[i]);
        }
    }

    #[test]
    fn heikin_ashi_independent_of_load_order() {
        let mut full = instrument(40, CandleStyle::HeikinAshi);
        let reference = full.candles(0..40).unwrap();

        let mut windowed = instrument(40, CandleStyle::HeikinAshi);
        let first = windowed.candle(30).unwrap();
        let seen = windowed.candle(26).unwrap();
        assert_eq!(first, reference[30]);
        assert_eq!(seen, reference[26]);

        windowed.ensure_cached(Some(0)).unwrap();
        assert_eq!(windowed.candle(26).unwrap(), seen);
        assert_eq!(windowed.candles(0..40).unwrap(), reference);
    }

    #[test]
    fn heikin_ashi_forward_fill_continues() {
        let mut inst = instrument(40, CandleStyle::HeikinAshi);
        inst.ensure_cached(Some(5)).unwrap();
        let last = inst.candle(8).unwrap();
        inst.ensure_cached(Some(12)).unwrap();
        let next = inst.candle(9).unwrap();
        assert!((next.open() - (last.open() + last.close()) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn simulated_clock_limits_count() {
        let mut inst = instrument(50, CandleStyle::Standard);
        inst.set_now(9 * MIN + 30_000);
        assert_eq!(inst.count(), 10);
        assert_eq!(inst.latest().unwrap().unwrap().timestamp(), 9 * MIN);
        assert!(inst.candle(10).is_err());

        inst.set_now(4 * MIN);
        assert_eq!(inst.count(), 5);
        assert!(inst.cached_range().end <= 5);
    }

    #[test]
    fn index_and_time_conversions() {
        let mut inst = instrument(100, CandleStyle::Standard);
        assert_eq!(inst.index_at(-1), None);
        // outside the (empty) cache: counted by the source
        assert_eq!(inst.index_at(70 * MIN + 5), Some(70));
        inst.ensure_cached(Some(70)).unwrap();
        // inside the cache: binary search
        assert_eq!(inst.index_at(71 * MIN), Some(71));
        assert_eq!(inst.index_at(1_000 * MIN), Some(99));

        let fidx = inst.findex_at(70 * MIN + 15_000).unwrap().unwrap();
        assert!((fidx - 70.25).abs() < 1e-12);
        assert_eq!(inst.time_at(70.25).unwrap(), 70 * MIN + 15_000);
    }

    #[test]
    fn new_candle_extends_count() {
        let data = Arc::new(RwLock::new(MemoryPriceData::new(TimeFrame::Min1, candles(10)).unwrap()));
        let mut inst = Instrument::new(pair(), Box::new(data.clone()), CandleStyle::Standard).with_chunk_size(4);
        assert_eq!(inst.latest().unwrap().unwrap().timestamp(), 9 * MIN);

        let next = Candle::try_from((10 * MIN, 100.0, 101.0, 99.0, 100.5, 1.0)).unwrap();
        let event = data.write().push(next).unwrap();
        assert_eq!(event, DataEvent::New { candle: next });
        inst.on_data_changed(&event).unwrap();
        assert_eq!(inst.count(), 11);
        assert_eq!(inst.latest().unwrap().unwrap(), next);
    }

    #[test]
    fn new_candle_refetches_previous() {
        let data = Arc::new(RwLock::new(MemoryPriceData::new(TimeFrame::Min1, candles(10)).unwrap()));
        let mut inst = Instrument::new(pair(), Box::new(data.clone()), CandleStyle::Standard).with_chunk_size(4);
        inst.latest().unwrap();

        // finalize candle 9 behind the instrument's back, then open candle 10
        let finished = Candle::try_from((9 * MIN, 90.0, 130.0, 80.0, 120.0, 99.0)).unwrap();
        data.write().update_latest(finished).unwrap();
        let next = Candle::try_from((10 * MIN, 120.0, 121.0, 119.0, 120.5, 1.0)).unwrap();
        let event = data.write().push(next).unwrap();
        inst.on_data_changed(&event).unwrap();

        assert_eq!(inst.candle(9).unwrap(), finished);
        assert_eq!(inst.candle(10).unwrap(), next);
    }

    #[test]
    fn new_candle_refetches_previous_after_clock_moves() {
        let data = Arc::new(RwLock::new(MemoryPriceData::new(TimeFrame::Min1, candles(10)).unwrap()));
        let mut inst = Instrument::new(pair(), Box::new(data.clone()), CandleStyle::Standard).with_chunk_size(4);
        inst.set_now(9 * MIN);
        inst.latest().unwrap();
        // moving the clock drops the count, the stale candle 9 is still cached
        inst.set_now(10 * MIN);

        let finished = Candle::try_from((9 * MIN, 90.0, 130.0, 80.0, 120.0, 99.0)).unwrap();
        data.write().update_latest(finished).unwrap();
        let next = Candle::try_from((10 * MIN, 120.0, 121.0, 119.0, 120.5, 1.0)).unwrap();
        let event = data.write().push(next).unwrap();
        inst.on_data_changed(&event).unwrap();

        let stored = data.read().read_candles(9..10).unwrap()[0];
        assert_eq!(stored.close(), 120.0);
        assert_eq!(inst.candle(9).unwrap(), stored);
        assert_eq!(inst.count(), 11);
        assert_eq!(inst.latest().unwrap().unwrap(), next);
    }

    #[test]
    fn new_candle_after_gap_recounts() {
        let data = Arc::new(RwLock::new(MemoryPriceData::new(TimeFrame::Min1, candles(10)).unwrap()));
        let mut inst = Instrument::new(pair(), Box::new(data.clone()), CandleStyle::Standard).with_chunk_size(4);
        assert_eq!(inst.count(), 10);

        let later = Candle::try_from((15 * MIN, 100.0, 101.0, 99.0, 100.5, 1.0)).unwrap();
        let event = data.write().push(later).unwrap();
        inst.on_data_changed(&event).unwrap();
        assert_eq!(inst.count(), 11);
        assert_eq!(inst.index_at(15 * MIN), Some(10));
    }

    #[test]
    fn current_update_must_match_latest() {
        let data = Arc::new(RwLock::new(MemoryPriceData::new(TimeFrame::Min1, candles(10)).unwrap()));
        let mut inst = Instrument::new(pair(), Box::new(data.clone()), CandleStyle::Standard).with_chunk_size(4);
        inst.latest().unwrap();

        let revised = Candle::try_from((9 * MIN, 100.0, 140.0, 60.0, 130.0, 5.0)).unwrap();
        let event = data.write().update_latest(revised).unwrap();
        inst.on_data_changed(&event).unwrap();
        assert_eq!(inst.latest().unwrap().unwrap(), revised);

        let wrong = DataEvent::Current {
            candle: Candle::try_from((8 * MIN, 100.0, 140.0, 60.0, 130.0, 5.0)).unwrap(),
        };
        assert!(matches!(
            inst.on_data_changed(&wrong),
            Err(Error::CandleTimestampMismatch { .. })
        ));
    }

    #[test]
    fn range_change_drops_cache() {
        let data = Arc::new(RwLock::new(MemoryPriceData::new(TimeFrame::Min1, candles(20)).unwrap()));
        let mut inst = Instrument::new(pair(), Box::new(data.clone()), CandleStyle::Standard).with_chunk_size(4);
        inst.ensure_cached(Some(2)).unwrap();

        let replacement = vec![Candle::try_from((3 * MIN, 50.0, 51.0, 49.0, 50.5, 1.0)).unwrap()];
        let event = data.write().replace_range(3, replacement.clone()).unwrap();
        assert_eq!(event, DataEvent::Range { range: 3..4 });
        inst.on_data_changed(&event).unwrap();

        assert!(inst.cached_range().contains(&19));
        assert_eq!(inst.candle(3).unwrap(), replacement[0]);
    }

    #[test]
    fn memory_source_rejects_unordered_candles() {
        let mut unordered = candles(3);
        unordered.swap(0, 2);
        assert!(MemoryPriceData::new(TimeFrame::Min1, unordered).is_err());
    }
}
