//! # SWING: order reconciliation core and price swing bot
//!
//! **SWING** is a Rust library modelling the life of a trade on a spot exchange: a draft
//! [`Trade`](engine::Trade) that is validated, submitted to become a live [`Order`](engine::Order),
//! and finally completed by one or more fills ([`OrderCompleted`](engine::OrderCompleted)).
//! On top of that it provides a sliding-window candle cache ([`Instrument`](engine::Instrument))
//! with Heikin-Ashi derivation, and the [`PriceSwing`](bot::PriceSwing) bot which pairs
//! unmatched one-sided trades against live prices for profit.
//!
//! ## Core Components
//! | Component   | Description                                                                                     |
//! |-------------|-------------------------------------------------------------------------------------------------|
//! | **`Candle`** | OHLCV data for one time bucket, with partial (sub) candle interpolation.                       |
//! | **`Instrument`** | Demand-loaded, contiguous candle cache over a `PriceData` source.                         |
//! | **`TradePair`** | Base/quote pair with order book depth, fees and valid ranges.                              |
//! | **`Fund`** | Per-coin balances with reservations held by live orders.                                      |
//! | **`Trade`** | A draft trade with bit-flag validation.                                                        |
//! | **`Order`** | A trade that is live on an exchange order book.                                                |
//! | **`OrderCompleted`** | The fills that satisfied an order.                                                    |
//! | **`SimExchange`** | Paper exchange used for backtesting and fake trading.                                    |
//! | **`PriceSwing`** | The swing trading bot and its matching algorithm.                                         |
//! | **`Backtest`** | Drives a bot over historical candles.                                                       |
//!
//! ## Price conventions
//! - `TradeType::B2Q` sells base for quote, `Q2B` buys base with quote.
//! - `amount_in` is in the trade's CoinIn, `amount_out` in its CoinOut.
//! - `price_q2b` is always quote per base. A "price" without suffix is CoinOut/CoinIn.
//!
//! ## Error Handling
//! Validation failures are data ([`Validation`](engine::Validation) flags), not errors.
//! Everything else is reported through [`errors::Error`]:
//! - Contract violations (updating an order with another identity, out of range candle index).
//! - Insufficient balance and unknown orders on the exchange.
//! - Persistence and configuration failures.
//!
//! ## License
//! MIT
#![warn(missing_docs)]

/// Trading primitives: candles, instruments, pairs, funds, trades, orders and the paper exchange.
pub mod engine;

/// Bot host interface, registry and the price swing bot.
pub mod bot;

/// Configuration for the bot and the backtester.
pub mod config;

/// Error types for the library.
pub mod errors;

/// Utility functions and helpers.
pub mod utils;

/// Re-exports of commonly used types and traits for convenience.
pub mod prelude {
    pub use super::*;
    pub use crate::bot::*;
    pub use crate::config::*;
    pub use crate::engine::*;
    pub use crate::errors::*;
}

/// Relative tolerance used to check that a trade's amounts agree with its price.
pub const PRICE_TOLERANCE: f64 = 0.0001;

/// Trait for comparing floating point values with a tolerance.
///
/// Exchange amounts are derived from order books, fees and rounding, so two values
/// that "should" be equal rarely are to the last bit.
pub trait FloatEq<Rhs = Self> {
    /// Returns true if `self` and `rhs` differ by at most `tol` relative to the larger magnitude.
    ///
    /// ### Arguments
    /// * `rhs` - The value to compare with.
    /// * `tol` - Relative tolerance (e.g., 0.0001 for 0.01%).
    fn feql_relative(self, rhs: Rhs, tol: Self) -> bool;

    /// Returns true if `self` and `rhs` are equal within `f64::EPSILON` relative tolerance.
    fn feql(self, rhs: Rhs) -> bool;
}

impl FloatEq for f64 {
    fn feql_relative(self, rhs: Self, tol: Self) -> bool {
        if self == rhs {
            return true;
        }
        let scale = self.abs().max(rhs.abs());
        (self - rhs).abs() <= tol * scale
    }

    fn feql(self, rhs: Self) -> bool {
        self.feql_relative(rhs, f64::EPSILON)
    }
}
