use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::engine::{Coin, Fund, Order, OrderId, TradeId, TradePair, TradeType};
use crate::errors::{Error, Result};

/// One atomic fill of an order.
///
/// `order_id` refers back to the [`OrderCompleted`] the fill belongs to; the fill does not
/// own it. `amount_out` is what was received after commission.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeCompleted {
    order_id: OrderId,
    trade_id: TradeId,
    amount_in: f64,
    amount_out: f64,
    commission: f64,
    commission_coin: Coin,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl TradeCompleted {
    /// Creates a fill.
    ///
    /// ### Returns
    /// `Error::InvalidFill` unless both amounts are strictly positive and the commission
    /// is not negative.
    pub fn new(
        order_id: OrderId,
        trade_id: TradeId,
        amount_in: f64,
        amount_out: f64,
        commission: f64,
        commission_coin: Coin,
        created: DateTime<Utc>,
    ) -> Result<Self> {
        if amount_in.is_nan() || amount_out.is_nan() || amount_in <= 0.0 || amount_out <= 0.0 {
            return Err(Error::InvalidFill(format!(
                "amounts must be positive (in: {amount_in}, out: {amount_out})"
            )));
        }
        if commission.is_nan() || commission < 0.0 {
            return Err(Error::InvalidFill(format!("negative commission {commission}")));
        }
        Ok(Self {
            order_id,
            trade_id,
            amount_in,
            amount_out,
            commission,
            commission_coin,
            created,
            updated: created,
        })
    }

    /// Id of the filled order.
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// Exchange id of this fill.
    pub fn trade_id(&self) -> TradeId {
        self.trade_id
    }

    /// Amount spent, in CoinIn.
    pub fn amount_in(&self) -> f64 {
        self.amount_in
    }

    /// Amount received net of commission, in CoinOut.
    pub fn amount_out(&self) -> f64 {
        self.amount_out
    }

    /// Fee charged on the fill.
    pub fn commission(&self) -> f64 {
        self.commission
    }

    /// Coin the commission is charged in.
    pub fn commission_coin(&self) -> &Coin {
        &self.commission_coin
    }

    /// Time of the fill.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Time the exchange last reported on the fill.
    pub fn updated(&self) -> DateTime<Utc> {
        self.updated
    }

    /// Marks the fill as revised by the exchange at `updated`.
    pub fn set_updated(&mut self, updated: DateTime<Utc>) {
        self.updated = updated;
    }
}

/// The fills that satisfied one order.
///
/// Totals and the average price are derived from the fills on every call.
#[derive(Debug, Clone)]
pub struct OrderCompleted {
    order_id: OrderId,
    fund: Fund,
    trade_type: TradeType,
    pair: Arc<TradePair>,
    trades: BTreeMap<TradeId, TradeCompleted>,
}

impl PartialEq for OrderCompleted {
    fn eq(&self, other: &Self) -> bool {
        self.order_id == other.order_id
            && self.trade_type == other.trade_type
            && self.pair == other.pair
            && self.trades.values().eq(other.trades.values())
    }
}

impl From<&Order> for OrderCompleted {
    fn from(order: &Order) -> Self {
        Self::new(order.order_id(), order.fund().clone(), order.trade_type(), Arc::clone(order.pair()))
    }
}

impl OrderCompleted {
    /// Creates an aggregate with no fills yet.
    pub fn new(order_id: OrderId, fund: Fund, trade_type: TradeType, pair: Arc<TradePair>) -> Self {
        Self {
            order_id,
            fund,
            trade_type,
            pair,
            trades: BTreeMap::new(),
        }
    }

    /// Id of the filled order.
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    /// Fund the order traded for.
    pub fn fund(&self) -> &Fund {
        &self.fund
    }

    /// Direction of the order.
    pub fn trade_type(&self) -> TradeType {
        self.trade_type
    }

    /// Pair of the order.
    pub fn pair(&self) -> &Arc<TradePair> {
        &self.pair
    }

    /// Fills ordered by trade id.
    pub fn trades(&self) -> impl Iterator<Item = &TradeCompleted> {
        self.trades.values()
    }

    /// Number of fills.
    pub fn len(&self) -> usize {
        self.trades.len()
    }

    /// True if nothing has been filled.
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    /// Adds a fill, replacing an earlier report of the same trade id.
    ///
    /// ### Returns
    /// `Error::FillOrderMismatch` if the fill belongs to another order.
    pub fn add(&mut self, fill: TradeCompleted) -> Result<()> {
        if fill.order_id != self.order_id {
            return Err(Error::FillOrderMismatch {
                expected: self.order_id,
                got: fill.order_id,
            });
        }
        self.trades.insert(fill.trade_id, fill);
        Ok(())
    }

    /// Total CoinIn spent.
    pub fn amount_in(&self) -> f64 {
        self.trades.values().map(|t| t.amount_in).sum()
    }

    /// Total CoinOut received.
    pub fn amount_out(&self) -> f64 {
        self.trades.values().map(|t| t.amount_out).sum()
    }

    /// Total commission charged.
    pub fn commission(&self) -> f64 {
        self.trades.values().map(|t| t.commission).sum()
    }

    /// Average price over all fills in CoinOut/CoinIn, zero before the first fill.
    pub fn price(&self) -> f64 {
        let amount_in = self.amount_in();
        if amount_in > 0.0 { self.amount_out() / amount_in } else { 0.0 }
    }

    /// Average price over all fills in quote per base, zero before the first fill.
    pub fn price_q2b(&self) -> f64 {
        let (amount_in, amount_out) = (self.amount_in(), self.amount_out());
        if amount_in <= 0.0 || amount_out <= 0.0 {
            return 0.0;
        }
        match self.trade_type {
            TradeType::B2Q => amount_out / amount_in,
            TradeType::Q2B => amount_in / amount_out,
        }
    }
}
