use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::engine::{Coin, Exchange, Fund, OrderResult, TradePair};
use crate::errors::{Error, Result};
use crate::{FloatEq, PRICE_TOLERANCE};

/// Direction of a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeType {
    /// Quote to base: buy base with quote.
    Q2B,
    /// Base to quote: sell base for quote.
    B2Q,
}

impl TradeType {
    /// Returns the reverse direction.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Q2B => Self::B2Q,
            Self::B2Q => Self::Q2B,
        }
    }

    /// The coin a trade of this type spends.
    pub fn coin_in<'a>(&self, pair: &'a TradePair) -> &'a Coin {
        match self {
            Self::Q2B => pair.quote(),
            Self::B2Q => pair.base(),
        }
    }

    /// The coin a trade of this type receives.
    pub fn coin_out<'a>(&self, pair: &'a TradePair) -> &'a Coin {
        self.opposite().coin_in(pair)
    }

    /// Converts a CoinOut/CoinIn price to quote per base.
    pub fn price_to_q2b(&self, price: f64) -> f64 {
        match self {
            Self::B2Q => price,
            Self::Q2B => 1.0 / price,
        }
    }

    /// Converts a quote per base price to CoinOut/CoinIn.
    pub fn price_from_q2b(&self, price_q2b: f64) -> f64 {
        // the conversion is its own inverse
        self.price_to_q2b(price_q2b)
    }
}

/// When and how a trade executes relative to the spot price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    /// Executes immediately against the book.
    Market,
    /// Rests on the book at a price no worse than spot.
    Limit,
    /// Triggers when the price moves through a level beyond spot.
    Stop,
}

bitflags::bitflags! {
    /// Problems found by [`Trade::validate`]. Several can be reported at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Validation: u32 {
        /// `amount_in` is zero or outside the pair's range.
        const AMOUNT_IN_OUT_OF_RANGE = 1 << 0;
        /// `amount_out` is zero or outside the pair's range.
        const AMOUNT_OUT_OUT_OF_RANGE = 1 << 1;
        /// `price_q2b` is zero or outside the pair's range.
        const PRICE_OUT_OF_RANGE = 1 << 2;
        /// `amount_out / amount_in` does not agree with `price_q2b`.
        const PRICE_INCONSISTENT = 1 << 3;
        /// A limit order would cross the spot price, or a stop order would not.
        const ORDER_TYPE_PRICE = 1 << 4;
        /// The fund can't cover `amount_in`.
        const INSUFFICIENT_BALANCE = 1 << 5;
    }
}

impl Validation {
    /// No problems.
    pub const VALID: Self = Self::empty();

    /// True if no flag is set.
    pub fn is_valid(&self) -> bool {
        self.is_empty()
    }
}

/// A proposed trade, not yet placed on an exchange.
///
/// `amount_in` and `amount_out` are both authoritative: an order book walk rarely gives
/// exactly `amount_in * price`, so neither is recomputed from the other. [`Trade::validate`]
/// flags them when they drift apart from `price_q2b`.
#[derive(Debug, Clone)]
pub struct Trade {
    fund: Fund,
    pair: Arc<TradePair>,
    order_type: OrderType,
    trade_type: TradeType,
    amount_in: f64,
    amount_out: f64,
    price_q2b: f64,
}

impl Trade {
    /// Creates a trade.
    ///
    /// ### Arguments
    /// * `fund` - The fund that pays `amount_in`.
    /// * `pair` - The pair traded.
    /// * `order_type` - Market, limit or stop.
    /// * `trade_type` - Direction.
    /// * `price_q2b` - Price in quote per base.
    /// * `amount_in` - Amount of CoinIn spent.
    /// * `amount_out` - Amount of CoinOut received.
    ///
    /// ### Returns
    /// The trade, or an error if an amount or the price is negative.
    pub fn new(
        fund: Fund,
        pair: Arc<TradePair>,
        order_type: OrderType,
        trade_type: TradeType,
        price_q2b: f64,
        amount_in: f64,
        amount_out: f64,
    ) -> Result<Self> {
        let mut trade = Self {
            fund,
            pair,
            order_type,
            trade_type,
            amount_in: 0.0,
            amount_out: 0.0,
            price_q2b: 0.0,
        };
        trade.set_price_q2b(price_q2b)?;
        trade.set_amount_in(amount_in)?;
        trade.set_amount_out(amount_out)?;
        Ok(trade)
    }

    /// Creates a trade whose `amount_out` is `amount_in` converted at `price_q2b`.
    pub fn from_amount_in(
        fund: Fund,
        pair: Arc<TradePair>,
        order_type: OrderType,
        trade_type: TradeType,
        price_q2b: f64,
        amount_in: f64,
    ) -> Result<Self> {
        let amount_out = amount_in * trade_type.price_from_q2b(price_q2b);
        let amount_out = if amount_out.is_finite() { amount_out } else { 0.0 };
        Self::new(fund, pair, order_type, trade_type, price_q2b, amount_in, amount_out)
    }

    /// Fund the trade draws on.
    pub fn fund(&self) -> &Fund {
        &self.fund
    }

    /// Pair being traded.
    pub fn pair(&self) -> &Arc<TradePair> {
        &self.pair
    }

    /// How the order will execute.
    pub fn order_type(&self) -> OrderType {
        self.order_type
    }

    /// Direction of the trade.
    pub fn trade_type(&self) -> TradeType {
        self.trade_type
    }

    /// Amount to spend, in CoinIn.
    pub fn amount_in(&self) -> f64 {
        self.amount_in
    }

    /// Amount to receive, in CoinOut.
    pub fn amount_out(&self) -> f64 {
        self.amount_out
    }

    /// Price in quote per base.
    pub fn price_q2b(&self) -> f64 {
        self.price_q2b
    }

    /// Price in CoinOut/CoinIn.
    pub fn price(&self) -> f64 {
        self.trade_type.price_from_q2b(self.price_q2b)
    }

    /// Coin spent.
    pub fn coin_in(&self) -> &Coin {
        self.trade_type.coin_in(&self.pair)
    }

    /// Coin received.
    pub fn coin_out(&self) -> &Coin {
        self.trade_type.coin_out(&self.pair)
    }

    /// Sets how the order will execute.
    pub fn set_order_type(&mut self, order_type: OrderType) {
        self.order_type = order_type;
    }

    /// Sets the amount to spend, leaving `amount_out` unchanged.
    pub fn set_amount_in(&mut self, amount_in: f64) -> Result<()> {
        if amount_in < 0.0 || amount_in.is_nan() {
            return Err(Error::NegativeAmount(amount_in));
        }
        self.amount_in = amount_in;
        Ok(())
    }

    /// Sets the amount to receive, leaving `amount_in` unchanged.
    pub fn set_amount_out(&mut self, amount_out: f64) -> Result<()> {
        if amount_out < 0.0 || amount_out.is_nan() {
            return Err(Error::NegativeAmount(amount_out));
        }
        self.amount_out = amount_out;
        Ok(())
    }

    /// Sets the price in quote per base.
    pub fn set_price_q2b(&mut self, price_q2b: f64) -> Result<()> {
        if price_q2b < 0.0 || price_q2b.is_nan() {
            return Err(Error::NegativePrice(price_q2b));
        }
        self.price_q2b = price_q2b;
        Ok(())
    }

    /// Checks the trade against the pair's limits, the spot price and the fund's balance.
    ///
    /// Every check runs; the returned flags hold all the problems found.
    ///
    /// ### Arguments
    /// * `reserved_balance_in` - Key of a reservation (e.g., a live order about to be replaced)
    ///   whose amount counts as available.
    /// * `additional_balance_in` - Extra CoinIn to count as available.
    ///
    /// ### Returns
    /// `Validation::VALID` when nothing is wrong.
    pub fn validate(&self, reserved_balance_in: Option<Uuid>, additional_balance_in: Option<f64>) -> Validation {
        let mut result = Validation::VALID;
        let tt = self.trade_type;

        if self.amount_in <= 0.0 || !self.pair.amount_range_in(tt).contains(&self.amount_in) {
            result |= Validation::AMOUNT_IN_OUT_OF_RANGE;
        }
        if self.amount_out <= 0.0 || !self.pair.amount_range_out(tt).contains(&self.amount_out) {
            result |= Validation::AMOUNT_OUT_OUT_OF_RANGE;
        }
        if self.price_q2b <= 0.0 || !self.pair.price_range_q2b().contains(&self.price_q2b) {
            result |= Validation::PRICE_OUT_OF_RANGE;
        }
        if self.amount_in > 0.0 && self.amount_out > 0.0 {
            let implied_q2b = tt.price_to_q2b(self.amount_out / self.amount_in);
            if !implied_q2b.feql_relative(self.price_q2b, PRICE_TOLERANCE) {
                result |= Validation::PRICE_INCONSISTENT;
            }
        }

        if let Some(spot) = self.pair.spot_price(tt) {
            let crosses = match tt {
                TradeType::Q2B => self.price_q2b > spot,
                TradeType::B2Q => self.price_q2b < spot,
            };
            let beyond = match tt {
                TradeType::Q2B => self.price_q2b < spot,
                TradeType::B2Q => self.price_q2b > spot,
            };
            match self.order_type {
                OrderType::Limit if crosses => result |= Validation::ORDER_TYPE_PRICE,
                OrderType::Stop if beyond => result |= Validation::ORDER_TYPE_PRICE,
                _ => {}
            }
        }

        let coin_in = self.coin_in();
        let available = self.fund.available(coin_in)
            + reserved_balance_in.map_or(0.0, |key| self.fund.reserved(coin_in, key))
            + additional_balance_in.unwrap_or(0.0);
        if self.amount_in > available {
            result |= Validation::INSUFFICIENT_BALANCE;
        }

        result
    }

    /// Submits this trade to `exchange`.
    ///
    /// Exchange failures are returned as is; nothing is retried.
    pub async fn create_order(
        &self,
        exchange: &dyn Exchange,
        cancel: CancellationToken,
        creator_name: &str,
    ) -> Result<OrderResult> {
        debug!(
            pair = %self.pair.name(),
            trade_type = ?self.trade_type,
            order_type = ?self.order_type,
            amount_in = self.amount_in,
            amount_out = self.amount_out,
            price_q2b = self.price_q2b,
            creator = creator_name,
            "Creating order"
        );
        exchange.create_order(self, cancel, creator_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MarketDepth, TradePair};

    fn pair() -> Arc<TradePair> {
        let pair = TradePair::new(Coin::new("BTC", "Sim"), Coin::new("USDT", "Sim"), 0.001)
            .with_amount_ranges(0.01..=10.0, 1.0..=10_000.0)
            .with_price_range(1.0..=1_000_000.0);
        pair.update_depth(MarketDepth::new(vec![(100.0, 5.0).into()], vec![(101.0, 5.0).into()]));
        Arc::new(pair)
    }

    fn fund(pair: &TradePair) -> Fund {
        let fund = Fund::new("main");
        fund.deposit(pair.base(), 2.0).unwrap();
        fund.deposit(pair.quote(), 500.0).unwrap();
        fund
    }

    #[test]
    fn trade_type_conversions() {
        assert_eq!(TradeType::B2Q.opposite(), TradeType::Q2B);
        assert_eq!(TradeType::B2Q.price_to_q2b(100.0), 100.0);
        assert_eq!(TradeType::Q2B.price_to_q2b(0.01), 100.0);
        assert_eq!(TradeType::Q2B.price_from_q2b(100.0), 0.01);
        let pair = pair();
        assert_eq!(TradeType::Q2B.coin_in(&pair).symbol(), "USDT");
        assert_eq!(TradeType::Q2B.coin_out(&pair).symbol(), "BTC");
    }

    #[test]
    fn negative_amounts_rejected() {
        let pair = pair();
        let fund = fund(&pair);
        let result = Trade::new(fund.clone(), pair.clone(), OrderType::Market, TradeType::B2Q, 100.0, -1.0, 0.0);
        assert!(matches!(result, Err(Error::NegativeAmount(_))));
        let result = Trade::new(fund, pair, OrderType::Market, TradeType::B2Q, -100.0, 1.0, 100.0);
        assert!(matches!(result, Err(Error::NegativePrice(_))));
    }

    #[test]
    fn zero_amounts_allowed_while_editing() {
        let pair = pair();
        let trade = Trade::new(fund(&pair), pair, OrderType::Market, TradeType::B2Q, 100.0, 0.0, 0.0).unwrap();
        let v = trade.validate(None, None);
        assert!(v.contains(Validation::AMOUNT_IN_OUT_OF_RANGE));
        assert!(v.contains(Validation::AMOUNT_OUT_OUT_OF_RANGE));
        assert!(!v.contains(Validation::PRICE_INCONSISTENT));
    }

    #[test]
    fn valid_market_trade() {
        let pair = pair();
        let trade = pair.make_trade(&fund(&pair), TradeType::B2Q, 1.0).unwrap();
        assert_eq!(trade.amount_out(), 100.0);
        assert_eq!(trade.price_q2b(), 100.0);
        assert_eq!(trade.validate(None, None), Validation::VALID);
        assert!(trade.validate(None, None).is_valid());
    }

    #[test]
    fn validation_is_idempotent() {
        let pair = pair();
        let trade = Trade::new(fund(&pair), pair, OrderType::Limit, TradeType::Q2B, 102.0, 600.0, 1.0).unwrap();
        let first = trade.validate(None, None);
        let second = trade.validate(None, None);
        assert_eq!(first, second);
    }

    #[test]
    fn reports_every_failure_at_once() {
        let pair = pair();
        // buy limit above the ask, more quote than we have, amounts that disagree with the price
        let trade = Trade::new(fund(&pair), pair, OrderType::Limit, TradeType::Q2B, 102.0, 600.0, 1.0).unwrap();
        let v = trade.validate(None, None);
        assert!(v.contains(Validation::ORDER_TYPE_PRICE));
        assert!(v.contains(Validation::INSUFFICIENT_BALANCE));
        assert!(v.contains(Validation::PRICE_INCONSISTENT));
        assert!(!v.contains(Validation::AMOUNT_IN_OUT_OF_RANGE));
    }

    #[test]
    fn inconsistent_price_within_tolerance() {
        let pair = pair();
        let fund = fund(&pair);
        let ok = Trade::new(fund.clone(), pair.clone(), OrderType::Market, TradeType::B2Q, 100.0, 1.0, 100.005).unwrap();
        assert!(!ok.validate(None, None).contains(Validation::PRICE_INCONSISTENT));
        let bad = Trade::new(fund, pair, OrderType::Market, TradeType::B2Q, 100.0, 1.0, 100.5).unwrap();
        assert!(bad.validate(None, None).contains(Validation::PRICE_INCONSISTENT));
    }

    #[test]
    fn limit_and_stop_sides_of_spot() {
        let pair = pair();
        let fund = fund(&pair);
        let make = |ot, tt, price: f64| Trade::from_amount_in(fund.clone(), pair.clone(), ot, tt, price, 1.0).unwrap();

        // sell limit below the bid crosses the book
        assert!(make(OrderType::Limit, TradeType::B2Q, 99.0).validate(None, None).contains(Validation::ORDER_TYPE_PRICE));
        assert!(!make(OrderType::Limit, TradeType::B2Q, 105.0).validate(None, None).contains(Validation::ORDER_TYPE_PRICE));
        // sell stop must be below the bid
        assert!(make(OrderType::Stop, TradeType::B2Q, 105.0).validate(None, None).contains(Validation::ORDER_TYPE_PRICE));
        assert!(!make(OrderType::Stop, TradeType::B2Q, 95.0).validate(None, None).contains(Validation::ORDER_TYPE_PRICE));
    }

    #[test]
    fn balance_counts_reserved_and_additional() {
        let pair = pair();
        let fund = fund(&pair);
        let key = Uuid::new_v4();
        fund.reserve(pair.base(), key, 1.5).unwrap();

        let trade = pair.make_trade(&fund, TradeType::B2Q, 1.0).unwrap();
        assert!(trade.validate(None, None).contains(Validation::INSUFFICIENT_BALANCE));
        assert!(trade.validate(Some(key), None).is_valid());
        assert!(trade.validate(None, Some(0.5)).is_valid());
    }
}
