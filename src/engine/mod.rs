//! Core trading engine components.
//!
//! This module provides the object model a bot trades through:
//! - `Candle` / `Instrument`: OHLCV data and the demand-loaded candle cache.
//! - `TradePair` / `Fund`: the market and the balances trades draw on.
//! - `Trade` -> `Order` -> `OrderCompleted`: a trade's life from draft to fills.
//! - `Exchange` / `SimExchange`: where orders are placed.
//! - `Backtest`: drives a bot over historical candles.

mod backtest;
mod candle;
mod completed;
mod exchange;
mod instrument;
mod order;
mod pair;
mod sim;
mod trade;
mod wallet;

pub use backtest::*;
pub use candle::*;
pub use completed::*;
pub use exchange::*;
pub use instrument::*;
pub use order::*;
pub use pair::*;
pub use sim::*;
pub use trade::*;
pub use wallet::*;

/// Exchange-assigned order identifier.
pub type OrderId = u64;

/// Exchange-assigned identifier of a single fill.
pub type TradeId = u64;
