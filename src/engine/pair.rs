use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::engine::{Fund, OrderType, Trade, TradeType};
use crate::errors::{Error, Result};

/// A currency on one exchange.
///
/// Two coins with the same symbol on different exchanges are different coins.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coin {
    symbol: Arc<str>,
    exchange: Arc<str>,
}

impl Coin {
    /// Creates a coin.
    pub fn new(symbol: &str, exchange: &str) -> Self {
        Self {
            symbol: Arc::from(symbol),
            exchange: Arc::from(exchange),
        }
    }

    /// Ticker symbol.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Name of the exchange the coin is held on.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

/// One price level of an order book. `price` is quote per base, `volume` is in base.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    /// Price in quote per base.
    pub price: f64,
    /// Base volume at this price.
    pub volume: f64,
}

impl From<(f64, f64)> for Level {
    fn from((price, volume): (f64, f64)) -> Self {
        Self { price, volume }
    }
}

/// Order book snapshot. Bids are sorted by descending price, asks by ascending price.
#[derive(Debug, Clone, Default)]
pub struct MarketDepth {
    bids: Vec<Level>,
    asks: Vec<Level>,
}

impl MarketDepth {
    /// Creates a snapshot, sorting both sides best price first.
    pub fn new(mut bids: Vec<Level>, mut asks: Vec<Level>) -> Self {
        bids.retain(|l| l.volume > 0.0);
        asks.retain(|l| l.volume > 0.0);
        bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        asks.sort_by(|a, b| a.price.total_cmp(&b.price));
        Self { bids, asks }
    }

    /// Synthesizes a book around `mid`: `levels` levels per side, `volume` base per level,
    /// the best bid/ask `spread_frac / 2` away from `mid` and each further level another
    /// `spread_frac / 2` out.
    pub fn synthetic(mid: f64, spread_frac: f64, levels: usize, volume: f64) -> Self {
        let step = mid * spread_frac / 2.0;
        let bids = (1..=levels).map(|i| Level::from((mid - step * i as f64, volume))).collect();
        let asks = (1..=levels).map(|i| Level::from((mid + step * i as f64, volume))).collect();
        Self::new(bids, asks)
    }

    /// Bids, best first.
    pub fn bids(&self) -> &[Level] {
        &self.bids
    }

    /// Asks, best first.
    pub fn asks(&self) -> &[Level] {
        &self.asks
    }

    /// The side of the book a trade of type `tt` consumes.
    fn side(&self, tt: TradeType) -> &[Level] {
        match tt {
            TradeType::B2Q => &self.bids,
            TradeType::Q2B => &self.asks,
        }
    }
}

/// An ordered (base, quote) pair of coins on one exchange.
#[derive(Debug)]
pub struct TradePair {
    base: Coin,
    quote: Coin,
    fee: f64,
    amount_range_base: RangeInclusive<f64>,
    amount_range_quote: RangeInclusive<f64>,
    price_range_q2b: RangeInclusive<f64>,
    auto_trade_limit_base: f64,
    auto_trade_limit_quote: f64,
    depth: RwLock<MarketDepth>,
}

impl PartialEq for TradePair {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.quote == other.quote
    }
}

impl TradePair {
    /// Creates a pair with unbounded ranges and limits and an empty order book.
    ///
    /// ### Arguments
    /// * `base` - The base coin.
    /// * `quote` - The quote coin.
    /// * `fee` - Fee fraction charged on each trade (e.g., 0.001 for 0.1%).
    pub fn new(base: Coin, quote: Coin, fee: f64) -> Self {
        Self {
            base,
            quote,
            fee,
            amount_range_base: 0.0..=f64::MAX,
            amount_range_quote: 0.0..=f64::MAX,
            price_range_q2b: 0.0..=f64::MAX,
            auto_trade_limit_base: f64::MAX,
            auto_trade_limit_quote: f64::MAX,
            depth: RwLock::new(MarketDepth::default()),
        }
    }

    /// Sets the valid order sizes in base and quote.
    pub fn with_amount_ranges(mut self, base: RangeInclusive<f64>, quote: RangeInclusive<f64>) -> Self {
        self.amount_range_base = base;
        self.amount_range_quote = quote;
        self
    }

    /// Sets the valid price range (quote per base).
    pub fn with_price_range(mut self, price_range_q2b: RangeInclusive<f64>) -> Self {
        self.price_range_q2b = price_range_q2b;
        self
    }

    /// Sets the largest amount a bot may trade automatically, per coin.
    pub fn with_auto_trade_limits(mut self, base: f64, quote: f64) -> Self {
        self.auto_trade_limit_base = base;
        self.auto_trade_limit_quote = quote;
        self
    }

    /// Returns "BASE/QUOTE".
    pub fn name(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }

    /// The coin being priced.
    pub fn base(&self) -> &Coin {
        &self.base
    }

    /// The coin prices are quoted in.
    pub fn quote(&self) -> &Coin {
        &self.quote
    }

    /// Fee fraction charged on each fill.
    pub fn fee(&self) -> f64 {
        self.fee
    }

    /// Valid range of `amount_in` for a trade of type `tt`.
    pub fn amount_range_in(&self, tt: TradeType) -> RangeInclusive<f64> {
        match tt {
            TradeType::B2Q => self.amount_range_base.clone(),
            TradeType::Q2B => self.amount_range_quote.clone(),
        }
    }

    /// Valid range of `amount_out` for a trade of type `tt`.
    pub fn amount_range_out(&self, tt: TradeType) -> RangeInclusive<f64> {
        self.amount_range_in(tt.opposite())
    }

    /// Valid range of prices in quote per base.
    pub fn price_range_q2b(&self) -> RangeInclusive<f64> {
        self.price_range_q2b.clone()
    }

    /// The auto-trade limit of the coin a trade of type `tt` spends.
    pub fn auto_trade_limit(&self, tt: TradeType) -> f64 {
        match tt {
            TradeType::B2Q => self.auto_trade_limit_base,
            TradeType::Q2B => self.auto_trade_limit_quote,
        }
    }

    /// Replaces the order book snapshot.
    pub fn update_depth(&self, depth: MarketDepth) {
        *self.depth.write() = depth;
    }

    /// Returns a copy of the current order book.
    pub fn depth(&self) -> MarketDepth {
        self.depth.read().clone()
    }

    /// Best price (quote per base) for an infinitesimal trade of type `tt`.
    pub fn spot_price(&self, tt: TradeType) -> Option<f64> {
        self.depth.read().side(tt).first().map(|l| l.price)
    }

    /// Amount of CoinOut received for `volume_in` of CoinIn, walking the order book.
    ///
    /// Volume beyond the depth of the book is priced at the last level.
    /// Returns `None` when the consumed side of the book is empty.
    pub fn amount_out(&self, tt: TradeType, volume_in: f64) -> Option<f64> {
        let depth = self.depth.read();
        let side = depth.side(tt);
        let last = side.last()?;

        let mut remaining = volume_in;
        let mut out = 0.0;
        for level in side {
            if remaining <= 0.0 {
                break;
            }
            // capacity of this level in CoinIn
            let capacity = match tt {
                TradeType::B2Q => level.volume,
                TradeType::Q2B => level.volume * level.price,
            };
            let take = remaining.min(capacity);
            out += match tt {
                TradeType::B2Q => take * level.price,
                TradeType::Q2B => take / level.price,
            };
            remaining -= take;
        }
        if remaining > 0.0 {
            out += match tt {
                TradeType::B2Q => remaining * last.price,
                TradeType::Q2B => remaining / last.price,
            };
        }
        Some(out)
    }

    /// Achievable price (CoinOut/CoinIn) for trading `volume_in` of CoinIn.
    pub fn price_for(&self, tt: TradeType, volume_in: f64) -> Option<f64> {
        if volume_in <= 0.0 {
            return self.spot_price(tt).map(|p| tt.price_from_q2b(p));
        }
        self.amount_out(tt, volume_in).map(|out| out / volume_in)
    }

    /// Creates a market trade for `volume_in` of CoinIn at the price the order book gives.
    ///
    /// ### Returns
    /// The trade, or `Error::NoMarketData` if the book has no levels on that side.
    pub fn make_trade(self: &Arc<Self>, fund: &Fund, tt: TradeType, volume_in: f64) -> Result<Trade> {
        let no_data = || Error::NoMarketData(self.name());
        let price_q2b = tt.price_to_q2b(self.price_for(tt, volume_in).ok_or_else(no_data)?);
        let amount_out = self.amount_out(tt, volume_in).ok_or_else(no_data)?;
        Trade::new(
            fund.clone(),
            Arc::clone(self),
            OrderType::Market,
            tt,
            price_q2b,
            volume_in,
            amount_out,
        )
    }

    /// Position a new order at `price_q2b` would take in the book it rests on.
    ///
    /// A trade of type `tt` rests on the opposite side to the one it consumes: a Q2B
    /// limit order joins the bids, a B2Q one the asks.
    ///
    /// ### Returns
    /// `(index, beyond)`, where `beyond` is true when the price is past every level.
    pub fn order_book_index(&self, tt: TradeType, price_q2b: f64) -> (usize, bool) {
        let depth = self.depth.read();
        let side = depth.side(tt.opposite());
        let index = match tt {
            // resting bids, descending
            TradeType::Q2B => side.partition_point(|l| l.price >= price_q2b),
            // resting asks, ascending
            TradeType::B2Q => side.partition_point(|l| l.price <= price_q2b),
        };
        (index, index == side.len())
    }

    /// Base volume resting ahead of an order at `price_q2b`.
    ///
    /// ### Returns
    /// `(volume, beyond)`, see [`TradePair::order_book_index`].
    pub fn order_book_depth(&self, tt: TradeType, price_q2b: f64) -> (f64, bool) {
        let (index, beyond) = self.order_book_index(tt, price_q2b);
        let depth = self.depth.read();
        let volume = depth.side(tt.opposite())[..index].iter().map(|l| l.volume).sum();
        (volume, beyond)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> TradePair {
        let pair = TradePair::new(Coin::new("BTC", "Sim"), Coin::new("USDT", "Sim"), 0.001);
        pair.update_depth(MarketDepth::new(
            vec![(99.0, 1.0).into(), (100.0, 1.0).into(), (98.0, 2.0).into()],
            vec![(102.0, 2.0).into(), (101.0, 1.0).into()],
        ));
        pair
    }

    #[test]
    fn depth_is_sorted_best_first() {
        let depth = pair().depth();
        assert_eq!(depth.bids()[0].price, 100.0);
        assert_eq!(depth.bids()[2].price, 98.0);
        assert_eq!(depth.asks()[0].price, 101.0);
    }

    #[test]
    fn spot_prices() {
        let pair = pair();
        assert_eq!(pair.spot_price(TradeType::B2Q), Some(100.0));
        assert_eq!(pair.spot_price(TradeType::Q2B), Some(101.0));
        assert_eq!(pair.name(), "BTC/USDT");
    }

    #[test]
    fn walk_bids_for_b2q() {
        let pair = pair();
        // 1 @ 100 + 0.5 @ 99
        assert_eq!(pair.amount_out(TradeType::B2Q, 1.5), Some(149.5));
        let price = pair.price_for(TradeType::B2Q, 1.5).unwrap();
        assert!((price - 149.5 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn walk_asks_for_q2b() {
        let pair = pair();
        // 101 quote buys the whole first level, 102 more buys 1 at 102
        let out = pair.amount_out(TradeType::Q2B, 203.0).unwrap();
        assert!((out - 2.0).abs() < 1e-12);
    }

    #[test]
    fn beyond_depth_uses_last_level() {
        let pair = pair();
        // 4 base of bids, selling 5: the last one goes at 98
        let out = pair.amount_out(TradeType::B2Q, 5.0).unwrap();
        assert_eq!(out, 100.0 + 99.0 + 2.0 * 98.0 + 98.0);
    }

    #[test]
    fn empty_book_has_no_price() {
        let pair = TradePair::new(Coin::new("BTC", "Sim"), Coin::new("USDT", "Sim"), 0.0);
        assert_eq!(pair.spot_price(TradeType::B2Q), None);
        assert_eq!(pair.price_for(TradeType::Q2B, 1.0), None);
    }

    #[test]
    fn order_book_position() {
        let pair = pair();
        // a Q2B limit at 99.5 rests after the 100 bid
        assert_eq!(pair.order_book_index(TradeType::Q2B, 99.5), (1, false));
        assert_eq!(pair.order_book_depth(TradeType::Q2B, 99.5), (1.0, false));
        // a B2Q limit at 103 rests behind every ask
        assert_eq!(pair.order_book_index(TradeType::B2Q, 103.0), (2, true));
        assert_eq!(pair.order_book_depth(TradeType::B2Q, 103.0), (3.0, true));
    }

    #[test]
    fn ranges_follow_trade_direction() {
        let pair = TradePair::new(Coin::new("BTC", "Sim"), Coin::new("USDT", "Sim"), 0.0)
            .with_amount_ranges(0.001..=10.0, 1.0..=1000.0)
            .with_auto_trade_limits(0.5, 50.0);
        assert_eq!(pair.amount_range_in(TradeType::B2Q), 0.001..=10.0);
        assert_eq!(pair.amount_range_out(TradeType::B2Q), 1.0..=1000.0);
        assert_eq!(pair.amount_range_in(TradeType::Q2B), 1.0..=1000.0);
        assert_eq!(pair.auto_trade_limit(TradeType::Q2B), 50.0);
    }

    #[test]
    fn coins_on_different_exchanges_differ() {
        assert_ne!(Coin::new("BTC", "A"), Coin::new("BTC", "B"));
    }
}
