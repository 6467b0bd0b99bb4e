use crate::engine::OrderId;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the engine, the bots and their persistence.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A candle breaks the OHLC ordering or carries a negative volume.
    #[error("Invalid candle: {0}")]
    InvalidCandle(String),

    /// `Candle::update` was called with a candle from another time bucket.
    #[error("Candle timestamp mismatch: expected {expected}, got {got}")]
    CandleTimestampMismatch {
        /// Timestamp of the candle being updated.
        expected: i64,
        /// Timestamp of the update.
        got: i64,
    },

    /// The candle data provided is empty.
    #[error("Candle data is empty")]
    CandleDataEmpty,

    /// A candle index outside `[0, count)` was requested.
    #[error("Candle index {index} out of range (count: {count})")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of candles available.
        count: usize,
    },

    /// An amount must not be negative (got: {0}).
    #[error("Amount must not be negative (got: {0})")]
    NegativeAmount(f64),

    /// A price must not be negative (got: {0}).
    #[error("Price must not be negative (got: {0})")]
    NegativePrice(f64),

    /// An order cannot have more remaining than its amount.
    #[error("Remaining amount {0} exceeds order amount {1}")]
    RemainingExceedsAmount(f64, f64),

    /// `Order::update` was given an order with another id, pair or trade type.
    #[error("Order identity mismatch: {0}")]
    OrderIdentityMismatch(String),

    /// A fill must have strictly positive amounts and a non-negative commission.
    #[error("Invalid fill: {0}")]
    InvalidFill(String),

    /// A fill was added to the aggregate of another order.
    #[error("Fill belongs to order {got}, not {expected}")]
    FillOrderMismatch {
        /// Order id of the aggregate.
        expected: OrderId,
        /// Order id carried by the fill.
        got: OrderId,
    },

    /// The fund does not have enough balance.
    #[error("Insufficient funds: required {0}, available {1}")]
    InsufficientFunds(f64, f64),

    /// The order was not found.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// The order book has no price for this trade direction.
    #[error("No market data for {0}")]
    NoMarketData(String),

    /// The trade records are not in ascending price order.
    #[error("Trade records out of order at position {0}")]
    RecordsOutOfOrder(usize),

    /// A fill or cancel notification referenced an order the bot doesn't know.
    #[error("Unrecognized order id: {0}")]
    UnrecognizedOrder(OrderId),

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// The exchange rejected or failed a request.
    #[error("Exchange error: {0}")]
    Exchange(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Trade records could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// No bot is registered under this name.
    #[error("Unknown bot: {0}")]
    UnknownBot(String),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}
