use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{OrderCompleted, OrderId, TradeType};
use crate::errors::{Error, Result};

/// Where a bot runs, which selects its trade record file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Real orders on a real exchange.
    Live,
    /// Trading disabled, orders go to a paper exchange.
    Fake,
    /// Replaying history.
    BackTesting,
}

impl RunMode {
    fn file_suffix(&self) -> &'static str {
        match self {
            Self::Live => "",
            Self::Fake => "-Fake",
            Self::BackTesting => "-BackTesting",
        }
    }
}

/// A filled one-sided trade waiting to be reversed at a profit.
///
/// `price` is CoinOut/CoinIn of the original trade. `match_trade_id` is the order closing the
/// round trip, if one is live; it is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TradeRecord {
    trade_type: TradeType,
    order_id: OrderId,
    price: f64,
    volume_in: f64,
    volume_out: f64,
    #[serde(default)]
    timestamp: i64,
    #[serde(skip)]
    match_trade_id: Option<OrderId>,
}

impl TradeRecord {
    /// Creates a record.
    ///
    /// ### Arguments
    /// * `trade_type` - Direction of the original trade.
    /// * `order_id` - Order of the original trade.
    /// * `price` - CoinOut/CoinIn.
    /// * `volume_in` - CoinIn spent.
    /// * `volume_out` - CoinOut received.
    /// * `timestamp` - Fill time (unix ms).
    ///
    /// ### Returns
    /// The record, or an error if the price or a volume is negative.
    pub fn new(
        trade_type: TradeType,
        order_id: OrderId,
        price: f64,
        volume_in: f64,
        volume_out: f64,
        timestamp: i64,
    ) -> Result<Self> {
        if price.is_nan() || price < 0.0 {
            return Err(Error::NegativePrice(price));
        }
        for volume in [volume_in, volume_out] {
            if volume.is_nan() || volume < 0.0 {
                return Err(Error::NegativeAmount(volume));
            }
        }
        Ok(Self {
            trade_type,
            order_id,
            price,
            volume_in,
            volume_out,
            timestamp,
            match_trade_id: None,
        })
    }

    /// Records a filled order.
    pub fn from_fill(fill: &OrderCompleted, timestamp: i64) -> Result<Self> {
        Self::new(
            fill.trade_type(),
            fill.order_id(),
            fill.price(),
            fill.amount_in(),
            fill.amount_out(),
            timestamp,
        )
    }

    /// Direction of the recorded trade.
    pub fn trade_type(&self) -> TradeType {
        self.trade_type
    }

    /// Exchange id of the order that made the record.
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// Price in CoinOut/CoinIn.
    pub fn price(&self) -> f64 {
        self.price
    }

    /// Price in quote per base.
    pub fn price_q2b(&self) -> f64 {
        self.trade_type.price_to_q2b(self.price)
    }

    /// Price of reversing the trade, CoinIn/CoinOut of the original.
    pub fn price_inv(&self) -> f64 {
        1.0 / self.price
    }

    /// Amount spent, in CoinIn.
    pub fn volume_in(&self) -> f64 {
        self.volume_in
    }

    /// Amount received, in CoinOut.
    pub fn volume_out(&self) -> f64 {
        self.volume_out
    }

    /// Fill time in unix milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Id of the order reversing this record, if one is live.
    pub fn match_trade_id(&self) -> Option<OrderId> {
        self.match_trade_id
    }
}

/// Trade records kept in ascending `price_q2b` order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TradeRecords {
    records: Vec<TradeRecord>,
}

impl TradeRecords {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorts `records` into a collection.
    pub fn from_vec(mut records: Vec<TradeRecord>) -> Self {
        records.sort_by(|a, b| a.price_q2b().total_cmp(&b.price_q2b()));
        Self { records }
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at `index`.
    pub fn get(&self, index: usize) -> Option<&TradeRecord> {
        self.records.get(index)
    }

    /// Records in ascending `price_q2b` order.
    pub fn iter(&self) -> std::slice::Iter<'_, TradeRecord> {
        self.records.iter()
    }

    /// Number of records of type `tt`.
    pub fn count(&self, tt: TradeType) -> usize {
        self.records.iter().filter(|r| r.trade_type == tt).count()
    }

    /// Inserts `record` after every record with the same or a lower price.
    ///
    /// ### Returns
    /// The position of the record.
    pub fn insert(&mut self, record: TradeRecord) -> usize {
        let price = record.price_q2b();
        let index = self.records.partition_point(|r| r.price_q2b() <= price);
        self.records.insert(index, record);
        index
    }

    /// Removes the record at `index`.
    pub fn remove(&mut self, index: usize) -> Option<TradeRecord> {
        (index < self.records.len()).then(|| self.records.remove(index))
    }

    /// Removes every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Position of the record being closed by order `order_id`.
    pub fn position_by_match(&self, order_id: OrderId) -> Option<usize> {
        self.records.iter().position(|r| r.match_trade_id == Some(order_id))
    }

    /// Sets or clears the order closing the record at `index`.
    pub fn set_match(&mut self, index: usize, order_id: Option<OrderId>) {
        if let Some(record) = self.records.get_mut(index) {
            record.match_trade_id = order_id;
        }
    }

    /// Finds a record priced within `threshold` of `price_q2b`, by binary search.
    pub fn nearby(&self, price_q2b: f64, threshold: f64) -> Option<&TradeRecord> {
        let index = self.records.partition_point(|r| r.price_q2b() < price_q2b - threshold);
        self.records
            .get(index)
            .filter(|r| r.price_q2b() <= price_q2b + threshold)
    }

    /// Checks the ascending price order.
    ///
    /// ### Returns
    /// `Error::RecordsOutOfOrder` with the first position breaking it.
    pub fn check_order(&self) -> Result<()> {
        match self
            .records
            .windows(2)
            .position(|w| w[0].price_q2b() > w[1].price_q2b())
        {
            Some(i) => Err(Error::RecordsOutOfOrder(i + 1)),
            None => Ok(()),
        }
    }
}

impl<'a> IntoIterator for &'a TradeRecords {
    type Item = &'a TradeRecord;
    type IntoIter = std::slice::Iter<'a, TradeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "root")]
struct RecordFile {
    #[serde(rename = "trade", default)]
    trades: Vec<TradeRecord>,
}

/// XML file holding a bot's trade records for one pair and run mode.
#[derive(Debug, Clone)]
pub struct TradeRecordStore {
    path: PathBuf,
}

impl TradeRecordStore {
    /// Store at `<data_dir>/Bots/<bot_name>/TradeRecord-<pair>[-BackTesting|-Fake].xml`, the pair
    /// name without its '/'.
    pub fn new(data_dir: &Path, bot_name: &str, pair_name: &str, mode: RunMode) -> Self {
        let file = format!("TradeRecord-{}{}.xml", pair_name.replace('/', ""), mode.file_suffix());
        Self {
            path: data_dir.join("Bots").join(bot_name).join(file),
        }
    }

    /// File the records are written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the records, skipping those stamped after `now` (unix ms).
    ///
    /// A missing file holds no records.
    pub fn load(&self, now: i64) -> Result<TradeRecords> {
        if !self.path.exists() {
            return Ok(TradeRecords::new());
        }
        let xml = fs::read_to_string(&self.path)?;
        let file: RecordFile = quick_xml::de::from_str(&xml).map_err(|e| Error::Persistence(e.to_string()))?;
        let records: Vec<_> = file.trades.into_iter().filter(|r| r.timestamp <= now).collect();
        debug!(path = %self.path.display(), count = records.len(), "Trade records loaded");
        Ok(TradeRecords::from_vec(records))
    }

    /// Writes every record, creating the directory if needed.
    pub fn save(&self, records: &TradeRecords) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = RecordFile {
            trades: records.records.clone(),
        };
        let xml = quick_xml::se::to_string(&file).map_err(|e| Error::Persistence(e.to_string()))?;
        fs::write(&self.path, xml)?;
        debug!(path = %self.path.display(), count = records.len(), "Trade records saved");
        Ok(())
    }
}
