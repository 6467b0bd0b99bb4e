use async_trait::async_trait;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info, warn};

use crate::bot::{Bot, BotContext, RunMode, TradeRecord, TradeRecordStore, TradeRecords};
use crate::config::SwingConfig;
use crate::engine::{OrderCompleted, OrderId, TradeType};
use crate::errors::{Error, Result};

/// Fraction of the computed volume actually traded, leaving room for fees and rounding.
const VOLUME_HEADROOM: f64 = 0.99999;

/// Swing trading bot.
///
/// Every filled one-sided trade becomes a [`TradeRecord`]. Each tick the bot:
/// 1. Reverses, per direction, the single record whose reversal now gains the most, if the
///    gain beats `price_change_frac` of spot.
/// 2. Opens a new one-sided trade unless a record or pending trade is already priced within
///    that threshold. The direction balances the number of records of each type.
///
/// A record is removed once its reversing order fills, closing the round trip.
pub struct PriceSwing {
    ctx: BotContext,
    config: SwingConfig,
    store: TradeRecordStore,
    records: TradeRecords,
    pending: Vec<TradeRecord>,
    rng: ChaCha8Rng,
    suppress_not_created: bool,
    round_trips: usize,
    profit_base: f64,
    profit_quote: f64,
}

impl PriceSwing {
    /// Registered name.
    pub const NAME: &'static str = "PriceSwing";

    /// Creates the bot. Records are read in `on_start`.
    pub fn new(ctx: BotContext, config: SwingConfig) -> Self {
        let mode = if ctx.backtesting {
            RunMode::BackTesting
        } else if !config.allow_trades {
            RunMode::Fake
        } else {
            RunMode::Live
        };
        let store = TradeRecordStore::new(&config.data_dir, &config.name, &ctx.pair.name(), mode);
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            ctx,
            config,
            store,
            records: TradeRecords::new(),
            pending: Vec::new(),
            rng,
            suppress_not_created: false,
            round_trips: 0,
            profit_base: 0.0,
            profit_quote: 0.0,
        }
    }

    /// Unmatched trades, ascending by price.
    pub fn records(&self) -> &TradeRecords {
        &self.records
    }

    /// New trades submitted but not filled yet.
    pub fn pending(&self) -> &[TradeRecord] {
        &self.pending
    }

    /// Where the records are saved.
    pub fn store(&self) -> &TradeRecordStore {
        &self.store
    }

    /// Number of round trips closed.
    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    /// Profit realized by closed round trips, as (base, quote).
    pub fn realized_profit(&self) -> (f64, f64) {
        (self.profit_base, self.profit_quote)
    }

    /// Runs a bulk change on the records and saves them once afterwards.
    pub fn suspend_saving<F>(&mut self, change: F)
    where
        F: FnOnce(&mut TradeRecords),
    {
        change(&mut self.records);
        self.save();
    }

    /// Forgets every record.
    pub fn clear_records(&mut self) {
        self.suspend_saving(TradeRecords::clear);
    }

    /// Direction of the next one-sided trade: whichever type has fewer records, with ties
    /// drawn from the seeded generator.
    pub fn new_trade_type(&mut self) -> TradeType {
        let b2q = self.records.count(TradeType::B2Q) as i64;
        let q2b = self.records.count(TradeType::Q2B) as i64;
        let sign = match b2q - q2b {
            0 => 2 * self.rng.random_range(0..2i64) - 1,
            sign => sign,
        };
        if sign > 0 { TradeType::Q2B } else { TradeType::B2Q }
    }

    /// True if a record or pending trade is priced within `threshold` of `price_q2b`.
    pub fn nearby_trades(&self, price_q2b: f64, threshold: f64) -> bool {
        self.pending
            .iter()
            .any(|r| (r.price_q2b() - price_q2b).abs() <= threshold)
            || self.records.nearby(price_q2b, threshold).is_some()
    }

    fn now_ms(&self) -> i64 {
        self.ctx.exchange.utc_now().timestamp_millis()
    }

    fn save(&self) {
        if let Err(e) = self.store.save(&self.records) {
            error!(path = %self.store.path().display(), error = %e, "Failed to save trade records");
        }
    }

    /// Submits the most profitable reversal of a record of type `tt`, if any beats the threshold.
    async fn match_records(&mut self, tt: TradeType) -> Result<()> {
        let pair = &self.ctx.pair;
        let rt = tt.opposite();
        let Some(spot_q2b) = pair.spot_price(rt) else {
            return Ok(());
        };
        let threshold = rt.price_from_q2b(spot_q2b) * self.config.price_change_frac;

        let mut best: Option<(usize, f64)> = None;
        for (index, record) in self.records.iter().enumerate() {
            if record.trade_type() != tt || record.match_trade_id().is_some() {
                continue;
            }
            let Some(price) = pair.price_for(rt, record.volume_out()) else {
                continue;
            };
            let dp = price - record.price_inv();
            if dp > threshold && best.is_none_or(|(_, best_dp)| dp > best_dp) {
                best = Some((index, dp));
            }
        }
        let Some((index, dp)) = best else {
            return Ok(());
        };
        let Some(record) = self.records.get(index) else {
            return Ok(());
        };

        let trade = pair.make_trade(&self.ctx.fund, rt, record.volume_out())?;
        let validation = trade.validate(None, None);
        if !validation.is_valid() {
            warn!(order_id = record.order_id(), ?validation, "Reversing trade not valid");
            return Ok(());
        }
        let record_id = record.order_id();
        let result = trade
            .create_order(self.ctx.exchange.as_ref(), self.ctx.cancel.clone(), &self.config.name)
            .await?;
        self.records.set_match(index, Some(result.order_id));
        info!(
            record = record_id,
            order_id = result.order_id,
            trade_type = ?rt,
            dp,
            threshold,
            "Reversing trade submitted"
        );
        Ok(())
    }

    /// Submits a new one-sided trade unless one is already near the current price.
    async fn open_new_trade(&mut self) -> Result<()> {
        let tt = self.new_trade_type();
        let pair = self.ctx.pair.clone();
        let Some(spot_q2b) = pair.spot_price(tt) else {
            debug!(pair = %pair.name(), "No price, skipping new trade");
            return Ok(());
        };

        let available = self.ctx.fund.available(tt.coin_in(&pair));
        let volume = (self.config.volume_frac * available * (1.0 - pair.fee()) * VOLUME_HEADROOM)
            .min(pair.auto_trade_limit(tt))
            .max(0.0);
        let threshold = spot_q2b * self.config.price_change_frac;
        if self.nearby_trades(spot_q2b, threshold) {
            return Ok(());
        }

        let trade = pair.make_trade(&self.ctx.fund, tt, volume)?;
        let validation = trade.validate(None, None);
        if !validation.is_valid() {
            if !self.suppress_not_created {
                warn!(trade_type = ?tt, volume, ?validation, "New trade not created");
                self.suppress_not_created = true;
            }
            return Ok(());
        }

        let result = trade
            .create_order(self.ctx.exchange.as_ref(), self.ctx.cancel.clone(), &self.config.name)
            .await?;
        self.pending.push(TradeRecord::new(
            tt,
            result.order_id,
            trade.price(),
            trade.amount_in(),
            trade.amount_out(),
            self.now_ms(),
        )?);
        self.suppress_not_created = false;
        info!(order_id = result.order_id, trade_type = ?tt, volume, price_q2b = trade.price_q2b(), "New trade submitted");
        Ok(())
    }
}

#[async_trait]
impl Bot for PriceSwing {
    async fn on_start(&mut self) -> Result<()> {
        let now = self.now_ms();
        self.records = match self.store.load(now) {
            Ok(records) => records,
            Err(e) => {
                error!(path = %self.store.path().display(), error = %e, "Failed to load trade records");
                TradeRecords::new()
            }
        };
        self.records.check_order()?;
        info!(pair = %self.ctx.pair.name(), records = self.records.len(), "PriceSwing started");
        Ok(())
    }

    async fn on_stop(&mut self) -> Result<()> {
        self.save();
        self.ctx.cancel.cancel();
        info!(
            pair = %self.ctx.pair.name(),
            records = self.records.len(),
            round_trips = self.round_trips,
            "PriceSwing stopped"
        );
        Ok(())
    }

    async fn step(&mut self) -> Result<()> {
        for tt in [TradeType::B2Q, TradeType::Q2B] {
            self.match_records(tt).await?;
        }
        self.open_new_trade().await
    }

    async fn on_position_filled(&mut self, order_id: OrderId, fill: &OrderCompleted) -> Result<()> {
        if let Some(index) = self.records.position_by_match(order_id) {
            let Some(record) = self.records.remove(index) else {
                return Err(Error::UnrecognizedOrder(order_id));
            };
            // the fill reverses the record: its CoinOut is the record's CoinIn and vice versa
            let profit_out = fill.amount_out() - record.volume_in();
            let profit_in = record.volume_out() - fill.amount_in();
            let (base, quote) = match fill.trade_type() {
                TradeType::B2Q => (profit_in, profit_out),
                TradeType::Q2B => (profit_out, profit_in),
            };
            self.profit_base += base;
            self.profit_quote += quote;
            self.round_trips += 1;
            info!(
                record = record.order_id(),
                order_id,
                profit_base = base,
                profit_quote = quote,
                "Round trip closed"
            );
            self.save();
            return Ok(());
        }

        if let Some(pos) = self.pending.iter().position(|r| r.order_id() == order_id) {
            self.pending.remove(pos);
            let record = TradeRecord::from_fill(fill, self.now_ms())?;
            let index = self.records.insert(record);
            debug!(order_id, index, "New trade recorded");
            self.save();
            return Ok(());
        }

        debug!(order_id, "Fill for an unrecognized order");
        Err(Error::UnrecognizedOrder(order_id))
    }

    async fn on_position_cancelled(&mut self, order_id: OrderId) -> Result<()> {
        if let Some(index) = self.records.position_by_match(order_id) {
            self.records.set_match(index, None);
            debug!(order_id, "Reversing trade cancelled, record unmatched");
            return Ok(());
        }
        if let Some(pos) = self.pending.iter().position(|r| r.order_id() == order_id) {
            self.pending.remove(pos);
            debug!(order_id, "New trade cancelled");
            return Ok(());
        }
        Err(Error::UnrecognizedOrder(order_id))
    }
}
